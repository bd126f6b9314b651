use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::blob_store::BlobStoreClient;
use crate::config::ServiceConfig;
use crate::database::BindingsDatabase;
use crate::funding::{FundingOutcome, FundingService};
use crate::llm_client::LlmClient;
use crate::personas::PersonaId;
use crate::transcript::Turn;

pub struct ServerState {
    pub llm: Option<LlmClient>,
    pub blob: BlobStoreClient,
    pub db: Arc<BindingsDatabase>,
    pub funding: Option<FundingService>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    persona: u32,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    messages: Vec<Turn>,
    persona: u32,
}

#[derive(Debug, Serialize)]
struct SaveResponse {
    success: bool,
    #[serde(rename = "blobId", skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    persona: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FetchBlobQuery {
    #[serde(rename = "blobId")]
    blob_id: String,
}

#[derive(Debug, Serialize)]
struct FetchBlobResponse {
    messages: Vec<Turn>,
}

// The persona travels as a string here, unlike everywhere else. The shape is
// part of the published contract, so it is parsed rather than fixed.
#[derive(Debug, Deserialize)]
struct StoreBlobIdRequest {
    address: String,
    persona: String,
    #[serde(rename = "blobId")]
    blob_id: String,
}

#[derive(Debug, Serialize)]
struct StoreBlobIdResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetrieveBlobIdQuery {
    address: String,
    persona: u32,
}

#[derive(Debug, Serialize)]
struct RetrieveBlobIdResponse {
    success: bool,
    #[serde(rename = "blobId", skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FundRequest {
    address: String,
}

#[derive(Debug, Serialize)]
struct FundResponse {
    success: bool,
    #[serde(rename = "txDigest", skip_serializing_if = "Option::is_none")]
    tx_digest: Option<String>,
    #[serde(rename = "alreadyFunded")]
    already_funded: bool,
}

pub async fn serve_backend(config: ServiceConfig) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let state = Arc::new(build_state(&config)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("AnonTherapy backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_state(config: &ServiceConfig) -> Result<ServerState> {
    let llm = config.llm_api_key.as_ref().map(|key| {
        LlmClient::new(
            config.llm_api_url.clone(),
            key.clone(),
            config.llm_model.clone(),
        )
    });
    if llm.is_none() {
        tracing::warn!("LLM_API_KEY is unset; /chat will report service unavailable");
    }

    let blob = BlobStoreClient::new(
        config.blob_publisher_url.clone(),
        config.blob_aggregator_url.clone(),
        config.blob_store_epochs,
    );

    let db = Arc::new(BindingsDatabase::new(&config.database_path)?);

    let funding = match (&config.funding_api_url, &config.funding_wallet_key) {
        (Some(api_url), Some(key)) => Some(FundingService::new(
            config.chain_rpc_url.clone(),
            api_url.clone(),
            key.clone(),
            config.funding_amount,
            db.clone(),
        )),
        _ => {
            tracing::warn!("Funding wallet not configured; /fund will report service unavailable");
            None
        }
    };

    Ok(ServerState {
        llm,
        blob,
        db,
        funding,
    })
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/save", post(save))
        .route("/fetchBlob", get(fetch_blob))
        .route("/store-blobid", post(store_blob_id))
        .route("/retrieve-blobid", get(retrieve_blob_id))
        .route("/fund", post(fund))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorBody>)> {
    let Some(llm) = state.llm.as_ref() else {
        return Err(service_unavailable("LLM API key not configured"));
    };

    let message = body.message.trim();
    if message.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "message cannot be empty".to_string(),
            }),
        ));
    }

    match llm.complete(PersonaId(body.persona), message).await {
        Ok(reply) => Ok(Json(ChatResponse { message: reply })),
        Err(error) => {
            tracing::warn!("Completion failed for persona {}: {:#}", body.persona, error);
            Err(service_unavailable("Error processing your request"))
        }
    }
}

async fn save(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SaveRequest>,
) -> Json<SaveResponse> {
    match state.blob.store(&body.messages).await {
        Ok(blob_id) => {
            tracing::info!(
                "Stored transcript for persona {} as blob {}",
                body.persona,
                blob_id
            );
            Json(SaveResponse {
                success: true,
                blob_id: Some(blob_id),
                persona: Some(body.persona),
                message: None,
            })
        }
        Err(error) => {
            tracing::warn!("Transcript store failed: {:#}", error);
            Json(SaveResponse {
                success: false,
                blob_id: None,
                persona: None,
                message: Some(error.to_string()),
            })
        }
    }
}

async fn fetch_blob(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<FetchBlobQuery>,
) -> Result<Json<FetchBlobResponse>, (StatusCode, Json<ErrorBody>)> {
    match state.blob.fetch(&query.blob_id).await {
        Ok(messages) => Ok(Json(FetchBlobResponse { messages })),
        Err(error) => {
            tracing::warn!("Blob fetch failed for {}: {:#}", query.blob_id, error);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: error.to_string(),
                }),
            ))
        }
    }
}

async fn store_blob_id(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<StoreBlobIdRequest>,
) -> Json<StoreBlobIdResponse> {
    let persona = match parse_persona(&body.persona) {
        Some(persona) => persona,
        None => {
            return Json(StoreBlobIdResponse {
                success: false,
                message: Some(format!("invalid persona '{}'", body.persona)),
            })
        }
    };

    match state.db.associate(&body.address, persona, &body.blob_id) {
        Ok(()) => Json(StoreBlobIdResponse {
            success: true,
            message: None,
        }),
        Err(error) => {
            tracing::warn!("Binding store failed: {:#}", error);
            Json(StoreBlobIdResponse {
                success: false,
                message: Some(error.to_string()),
            })
        }
    }
}

async fn retrieve_blob_id(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<RetrieveBlobIdQuery>,
) -> Result<Json<RetrieveBlobIdResponse>, (StatusCode, Json<ErrorBody>)> {
    match state.db.lookup(&query.address, PersonaId(query.persona)) {
        Ok(Some(blob_id)) => Ok(Json(RetrieveBlobIdResponse {
            success: true,
            blob_id: Some(blob_id),
        })),
        Ok(None) => Ok(Json(RetrieveBlobIdResponse {
            success: false,
            blob_id: None,
        })),
        Err(error) => {
            tracing::warn!("Binding lookup failed: {:#}", error);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: error.to_string(),
                }),
            ))
        }
    }
}

async fn fund(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<FundRequest>,
) -> Result<Json<FundResponse>, (StatusCode, Json<ErrorBody>)> {
    let Some(funding) = state.funding.as_ref() else {
        return Err(service_unavailable("Funding wallet not configured"));
    };

    let address = body.address.trim();
    if address.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "address cannot be empty".to_string(),
            }),
        ));
    }

    match funding.fund_if_unfunded(address).await {
        Ok(FundingOutcome::Granted { tx_digest }) => Ok(Json(FundResponse {
            success: true,
            tx_digest: Some(tx_digest),
            already_funded: false,
        })),
        Ok(FundingOutcome::AlreadyFunded) => Ok(Json(FundResponse {
            success: true,
            tx_digest: None,
            already_funded: true,
        })),
        Ok(FundingOutcome::NotNeeded) => Ok(Json(FundResponse {
            success: true,
            tx_digest: None,
            already_funded: false,
        })),
        Err(error) => {
            tracing::warn!("Funding failed for {}: {:#}", address, error);
            Err(service_unavailable("Error processing funding request"))
        }
    }
}

fn parse_persona(raw: &str) -> Option<PersonaId> {
    raw.trim().parse::<u32>().ok().map(PersonaId)
}

fn service_unavailable(message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<ServerState> {
        let mut path = std::env::temp_dir();
        path.push(format!("anontherapy_server_{}.db", uuid::Uuid::new_v4()));
        let db = Arc::new(BindingsDatabase::new(&path).expect("db init"));
        Arc::new(ServerState {
            llm: None,
            blob: BlobStoreClient::new(
                "http://127.0.0.1:1".to_string(),
                "http://127.0.0.1:1".to_string(),
                1,
            ),
            db,
            funding: None,
        })
    }

    #[tokio::test]
    async fn chat_without_credential_is_a_500_with_error_body() {
        let state = test_state();
        let result = chat(
            State(state),
            Json(ChatRequest {
                message: "hello".to_string(),
                persona: 1,
            }),
        )
        .await;

        let (status, Json(body)) = result.expect_err("missing credential must fail");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "LLM API key not configured");
    }

    #[tokio::test]
    async fn fund_without_wallet_config_is_a_500() {
        let state = test_state();
        let result = fund(
            State(state),
            Json(FundRequest {
                address: "0xabc".to_string(),
            }),
        )
        .await;

        let (status, _) = result.expect_err("missing funding config must fail");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn store_then_retrieve_blobid_roundtrips() {
        let state = test_state();

        let Json(stored) = store_blob_id(
            State(state.clone()),
            Json(StoreBlobIdRequest {
                address: "0xabc".to_string(),
                persona: "2".to_string(),
                blob_id: "blob-7".to_string(),
            }),
        )
        .await;
        assert!(stored.success);

        let Json(found) = retrieve_blob_id(
            State(state.clone()),
            Query(RetrieveBlobIdQuery {
                address: "0xabc".to_string(),
                persona: 2,
            }),
        )
        .await
        .expect("lookup succeeds");
        assert!(found.success);
        assert_eq!(found.blob_id.as_deref(), Some("blob-7"));

        let Json(absent) = retrieve_blob_id(
            State(state),
            Query(RetrieveBlobIdQuery {
                address: "0xabc".to_string(),
                persona: 3,
            }),
        )
        .await
        .expect("lookup succeeds");
        assert!(!absent.success);
        assert!(absent.blob_id.is_none());
    }

    #[tokio::test]
    async fn store_blobid_rejects_unparseable_persona() {
        let state = test_state();
        let Json(response) = store_blob_id(
            State(state),
            Json(StoreBlobIdRequest {
                address: "0xabc".to_string(),
                persona: "two".to_string(),
                blob_id: "blob-7".to_string(),
            }),
        )
        .await;
        assert!(!response.success);
        assert!(response.message.unwrap().contains("invalid persona"));
    }

    #[test]
    fn save_response_uses_camel_case_blob_id_and_omits_absent_fields() {
        let ok = serde_json::to_value(SaveResponse {
            success: true,
            blob_id: Some("abc".to_string()),
            persona: Some(2),
            message: None,
        })
        .expect("serialize");
        assert_eq!(ok["blobId"], "abc");
        assert_eq!(ok["persona"], 2);
        assert!(ok.get("message").is_none());

        let failed = serde_json::to_value(SaveResponse {
            success: false,
            blob_id: None,
            persona: None,
            message: Some("boom".to_string()),
        })
        .expect("serialize");
        assert!(failed.get("blobId").is_none());
        assert_eq!(failed["message"], "boom");
    }

    #[test]
    fn fund_response_shape_matches_contract() {
        let granted = serde_json::to_value(FundResponse {
            success: true,
            tx_digest: Some("digest-1".to_string()),
            already_funded: false,
        })
        .expect("serialize");
        assert_eq!(granted["txDigest"], "digest-1");
        assert_eq!(granted["alreadyFunded"], false);
    }

    #[test]
    fn parse_persona_accepts_digits_only() {
        assert_eq!(parse_persona("2"), Some(PersonaId(2)));
        assert_eq!(parse_persona(" 4 "), Some(PersonaId(4)));
        assert_eq!(parse_persona("two"), None);
        assert_eq!(parse_persona(""), None);
    }
}
