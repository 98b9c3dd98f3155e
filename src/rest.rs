//! A HTTP API for the client connections and for observing the coordinator.
//!
//! | Route | |
//! |---|---|
//! | `GET /ws` | upgrades to the persistent client channel |
//! | `GET /model` | the latest committed global state |
//! | `GET /convergence` | the convergence signal of the last closed round |
//! | `GET /rounds` | the round records of the ledger |
//! | `GET /clients/{id}` | what the coordinator knows about a client |
//! | `POST /schema` | schedules a schema change for the next round |

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use warp::{http::StatusCode, reply::Reply, ws::Ws, Filter};

use crate::{
    common::ClientId,
    services::{
        fetchers::Fetcher,
        messages::{MessageHandler, ServerMessage, ServiceError},
        session,
    },
    settings::ApiSettings,
    state_machine::requests::{ErrorCategory, RequestError, Response, StateMachineRequest},
    storage::LedgerStorage,
};

/// The body of a schema change request.
#[derive(Debug, Deserialize, Serialize)]
pub struct SchemaChange {
    pub length: usize,
}

/// Starts a HTTP server at the given address, serving the client channel and the
/// observability routes.
///
/// * `api_settings`: address of the server.
/// * `fetcher`: fetcher for responding to data requests.
/// * `message_handler`: handler for client messages and admin requests.
/// * `store`: the round ledger, read for the round history.
pub async fn serve<F, T>(
    api_settings: ApiSettings,
    fetcher: F,
    message_handler: MessageHandler,
    store: T,
) -> Result<(), RestError>
where
    F: Fetcher + Sync + Send + 'static + Clone,
    T: LedgerStorage,
{
    let routes = routes(fetcher, message_handler, store);
    run_http(routes, api_settings).await
}

/// Builds the routes of the API.
pub fn routes<F, T>(
    fetcher: F,
    message_handler: MessageHandler,
    store: T,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone
where
    F: Fetcher + Sync + Send + 'static + Clone,
    T: LedgerStorage,
{
    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(with_message_handler(message_handler.clone()))
        .map(|ws: Ws, handler: MessageHandler| {
            ws.on_upgrade(move |socket| session::serve(socket, handler))
        });

    let model = warp::path!("model")
        .and(warp::get())
        .and(with_fetcher(fetcher.clone()))
        .and_then(handle_model);

    let convergence = warp::path!("convergence")
        .and(warp::get())
        .and(with_fetcher(fetcher))
        .and_then(handle_convergence);

    let rounds = warp::path!("rounds")
        .and(warp::get())
        .and(with_store(store))
        .and_then(handle_rounds);

    let client = warp::path!("clients" / String)
        .and(warp::get())
        .and(with_message_handler(message_handler.clone()))
        .and_then(handle_client);

    let schema = warp::path!("schema")
        .and(warp::post())
        .and(warp::body::json::<SchemaChange>())
        .and(with_message_handler(message_handler))
        .and_then(handle_schema);

    ws.or(model)
        .or(convergence)
        .or(rounds)
        .or(client)
        .or(schema)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Handles and responds to a request for the global state.
async fn handle_model<F: Fetcher>(mut fetcher: F) -> Result<impl warp::Reply, Infallible> {
    Ok(match fetcher.model().await {
        Ok(model) => warp::reply::with_status(warp::reply::json(model.as_ref()), StatusCode::OK),
        Err(e) => {
            warn!("failed to handle model request: {:?}", e);
            internal_error()
        }
    })
}

/// Handles and responds to a request for the convergence signal.
async fn handle_convergence<F: Fetcher>(mut fetcher: F) -> Result<impl warp::Reply, Infallible> {
    Ok(match fetcher.convergence().await {
        Ok(Some(signal)) => warp::reply::with_status(warp::reply::json(&signal), StatusCode::OK),
        Ok(None) => warp::reply::with_status(warp::reply::json(&()), StatusCode::NO_CONTENT),
        Err(e) => {
            warn!("failed to handle convergence request: {:?}", e);
            internal_error()
        }
    })
}

/// Handles and responds to a request for the round history.
async fn handle_rounds<T: LedgerStorage>(mut store: T) -> Result<impl warp::Reply, Infallible> {
    Ok(match store.rounds().await {
        Ok(rounds) => warp::reply::with_status(warp::reply::json(&rounds), StatusCode::OK),
        Err(e) => {
            warn!("failed to read the round history: {:?}", e);
            let err = ServiceError::from(RequestError::Ledger(e));
            rejection(&err)
        }
    })
}

/// Handles and responds to a request for the information on a client.
async fn handle_client(
    client_id: String,
    mut handler: MessageHandler,
) -> Result<impl warp::Reply, Infallible> {
    let req = StateMachineRequest::ClientInfo(ClientId::from(client_id));
    Ok(match handler.request(req).await {
        Ok(Response::Client(info)) => {
            warp::reply::with_status(warp::reply::json(&info), StatusCode::OK)
        }
        Ok(resp) => {
            warn!("unexpected response to a client info request: {:?}", resp);
            internal_error()
        }
        Err(err) => rejection(&err),
    })
}

/// Handles and responds to a schema change request.
async fn handle_schema(
    change: SchemaChange,
    mut handler: MessageHandler,
) -> Result<impl warp::Reply, Infallible> {
    let req = StateMachineRequest::UpdateSchema(change.length);
    Ok(match handler.request(req).await {
        Ok(_) => warp::reply::with_status(warp::reply::json(&change), StatusCode::ACCEPTED),
        Err(err) => rejection(&err),
    })
}

/// Replies with the reason code of a failed request.
fn rejection(err: &ServiceError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match err {
        ServiceError::StateMachine(RequestError::UnknownClient(_)) => StatusCode::NOT_FOUND,
        _ => match err.category() {
            ErrorCategory::Protocol => StatusCode::BAD_REQUEST,
            ErrorCategory::Policy => StatusCode::FORBIDDEN,
            ErrorCategory::Quorum => StatusCode::CONFLICT,
            ErrorCategory::Liveness | ErrorCategory::Internal => StatusCode::SERVICE_UNAVAILABLE,
        },
    };
    warp::reply::with_status(warp::reply::json(&ServerMessage::rejected(err)), status)
}

fn internal_error() -> warp::reply::WithStatus<warp::reply::Json> {
    let err = ServiceError::InternalError("the request could not be processed".to_string());
    warp::reply::with_status(
        warp::reply::json(&ServerMessage::rejected(&err)),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

/// Converts a message handler into a `warp` filter.
fn with_message_handler(
    handler: MessageHandler,
) -> impl Filter<Extract = (MessageHandler,), Error = Infallible> + Clone {
    warp::any().map(move || handler.clone())
}

/// Converts a data fetcher into a `warp` filter.
fn with_fetcher<F: Fetcher + Sync + Send + 'static + Clone>(
    fetcher: F,
) -> impl Filter<Extract = (F,), Error = Infallible> + Clone {
    warp::any().map(move || fetcher.clone())
}

/// Converts a ledger into a `warp` filter.
fn with_store<T: LedgerStorage>(store: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else if err.find::<warp::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(warp::reply::with_status(Vec::new(), code))
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("failed to bind the server: {0}")]
    Bind(#[from] warp::Error),
}

/// Runs a server with the provided filter routes.
///
/// # Errors
/// Fails if the server cannot bind to the configured address.
async fn run_http<F>(filter: F, api_settings: ApiSettings) -> Result<(), RestError>
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply,
{
    let (address, server) = warp::serve(filter).try_bind_ephemeral(api_settings.bind_address)?;
    info!("listening on {}", address);
    server.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rayon::ThreadPoolBuilder;
    use serde_json::{json, Value};
    use warp::test::WsClient;

    use super::*;
    use crate::{
        common::GlobalState,
        services::fetchers::fetcher,
        state_machine::{tests::utils, StateMachineInitializer},
        storage::{MemoryLedger, RoundOutcome, RoundRecord},
    };

    async fn api(
        store: MemoryLedger,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone + 'static {
        let (state_machine, request_tx, events) =
            StateMachineInitializer::new(utils::coordinator_settings(), store.clone())
                .init()
                .await
                .unwrap();
        tokio::spawn(state_machine.run());

        let thread_pool = Arc::new(ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let handler = MessageHandler::new(1024, thread_pool, request_tx);
        routes(fetcher(&events), handler, store)
    }

    async fn recv(client: &mut WsClient) -> Value {
        let msg = client.recv().await.unwrap();
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    fn body(resp: &warp::http::Response<bytes::Bytes>) -> Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn test_model() {
        let api = api(MemoryLedger::new()).await;

        let resp = warp::test::request().path("/model").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let state: GlobalState = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(state.weights, vec![0.; 4]);
        assert_eq!(state.round_id, 0);

        let resp = warp::test::request().path("/convergence").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_rounds() {
        let mut store = MemoryLedger::new();
        let record = RoundRecord {
            round_id: 1,
            status: RoundOutcome::TimedOut,
            participant_ids: Vec::new(),
            admitted_count: 0,
            convergence_score: None,
            accuracy_delta: None,
            privacy_spent: 0.,
            participations: Vec::new(),
            started_at: Utc::now(),
            timestamp: Utc::now(),
        };
        store.append_round(&record).await.unwrap();
        let api = api(store).await;

        let resp = warp::test::request().path("/rounds").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let rounds: Vec<RoundRecord> = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(rounds, vec![record]);
    }

    #[tokio::test]
    async fn test_unknown_client_and_route() {
        let api = api(MemoryLedger::new()).await;

        let resp = warp::test::request().path("/clients/nobody").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&resp)["code"], "UNKNOWN_CLIENT");

        let resp = warp::test::request().path("/params").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_change() {
        let api = api(MemoryLedger::new()).await;

        let resp = warp::test::request()
            .method("POST")
            .path("/schema")
            .json(&json!({"length": 6}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = warp::test::request()
            .method("POST")
            .path("/schema")
            .json(&json!({"length": 0}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&resp)["code"], "INVALID_SCHEMA");

        let resp = warp::test::request()
            .method("POST")
            .path("/schema")
            .body("six")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_client_session() {
        let api = api(MemoryLedger::new()).await;
        let mut client = warp::test::ws().path("/ws").handshake(api.clone()).await.unwrap();

        // nothing but a registration is accepted first
        client.send_text(json!({"kind": "HEARTBEAT"}).to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["kind"], "REJECTED");
        assert_eq!(msg["code"], "NOT_REGISTERED");

        client.send_text("x".repeat(2048)).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["code"], "MESSAGE_TOO_LARGE");

        let register = json!({
            "kind": "REGISTER",
            "client_id": "a",
            "capabilities": {"dataset_size": 10},
        });
        client.send_text(register.to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["kind"], "REGISTERED");
        assert_eq!(msg["config"]["round_id"], 1);
        assert_eq!(msg["config"]["model_length"], 4);

        client.send_text(json!({"kind": "CURRENT_STATE"}).to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["kind"], "CURRENT_STATE");
        assert_eq!(msg["global_state"]["weights"], json!([0.0, 0.0, 0.0, 0.0]));

        // a successful heartbeat is not answered, so the next reply belongs to the next frame
        client.send_text(json!({"kind": "HEARTBEAT"}).to_string()).await;
        client.send_text("{").await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["code"], "MALFORMED_MESSAGE");

        let submission = json!({
            "kind": "SUBMIT_CONTRIBUTION",
            "round_id": 1,
            "version": 1,
            "delta": [0.1, 0.0, 0.0, 0.0],
            "accuracy_delta": 0.01,
            "noised": true,
        });
        client.send_text(submission.to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["kind"], "ADMITTED");
        assert_eq!(msg["round_id"], 1);

        client.send_text(submission.to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["code"], "DUPLICATE_SUBMISSION");
        assert_eq!(msg["category"], "PROTOCOL");

        let resp = warp::test::request().path("/clients/a").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let info = body(&resp);
        assert_eq!(info["client_id"], "a");
        assert_eq!(info["state"], "IN_ROUND");

        client.send_text(json!({"kind": "DISCONNECT"}).to_string()).await;
        let msg = recv(&mut client).await;
        assert_eq!(msg["kind"], "ACK");
        client.recv_closed().await.unwrap();

        let resp = warp::test::request().path("/clients/a").reply(&api).await;
        assert_eq!(body(&resp)["state"], "DISCONNECTED");
    }
}
