use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use atelier_core::{
    DeviceMap, GenerateError, GenerationRequest, GeneratorConfig, ImageGenerator,
};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Atelier image generation studio")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to load at startup
    #[arg(long, default_value = "runwayml/stable-diffusion-v1-5")]
    model: String,

    /// Directory generated images are written to
    #[arg(long, default_value = "generated_images")]
    output_dir: PathBuf,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize)]
struct GenerationResponse {
    status: String,
    image: String,
    path: String,
}

#[derive(Deserialize)]
struct UpgradeRequest {
    model: String,
}

#[derive(Serialize)]
struct UpgradeResponse {
    status: String,
    ready: bool,
}

// Application state containing the generator and its loaded pipeline.
#[derive(Clone)]
struct AppState(Arc<ImageGenerator>);

async fn index(State(state): State<AppState>) -> Html<String> {
    let config = state.0.config();
    let page = include_str!("index.html")
        .replace("{{negative_prompt}}", &config.default_negative_prompt)
        .replace("{{steps}}", &config.num_inference_steps.to_string())
        .replace("{{guidance}}", &config.guidance_scale.to_string());
    Html(page)
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    if req.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Please enter a prompt!".to_string()).into_response();
    }
    match generate_image(&state, &req) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            error!("error generating image: {e:?}");
            let status = match e.downcast_ref::<GenerateError>() {
                Some(GenerateError::PipelineNotReady) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, format!("Generation failed: {e}")).into_response()
        }
    }
}

/// Runs one generation against the shared generator. The pipeline call
/// blocks this worker thread for the whole run; requests are not
/// queued or cancelable.
fn generate_image(state: &AppState, req: &GenerationRequest) -> Result<GenerationResponse> {
    let generated = state.0.generate(req)?;
    let image = image_to_base64_png(&generated.image)?;
    Ok(GenerationResponse {
        status: format!("Image generated for: {:?}", req.prompt),
        image,
        path: generated.path.display().to_string(),
    })
}

async fn upgrade_model_handler(
    State(state): State<AppState>,
    Json(req): Json<UpgradeRequest>,
) -> impl IntoResponse {
    state.0.upgrade_model(&req.model).await;
    let ready = state.0.handler().is_ready();
    let status = if ready {
        format!("Model upgraded to: {}", req.model)
    } else {
        format!("Failed to load model: {} (see server logs)", req.model)
    };
    Json(UpgradeResponse { status, ready })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = GeneratorConfig {
        model_name: args.model,
        device: if args.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        },
        output_dir: args.output_dir,
        ..GeneratorConfig::default()
    };

    let generator = ImageGenerator::new(config);
    // A failed startup load is not fatal: the GUI reports the state and
    // a later model upgrade can recover.
    generator.load_model().await;

    let state = AppState(Arc::new(generator));

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/", get(index))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/models", post(upgrade_model_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
