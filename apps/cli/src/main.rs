//! Fetch FHIR resources through the SMART client from the command line.
//!
//! Useful against open test servers (no launch context) or with a bearer
//! token supplied via `--token`:
//!
//! ```text
//! funke --server https://r4.smarthealthit.org "Observation?code=4548-4" \
//!     --resolve subject --pages 2 --flat
//! ```

use anyhow::Context;
use clap::Parser;
use funke_smart_client::{FhirOptions, FhirResult, SessionState, SmartClient};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "funke", about = "Fetch FHIR resources through the SMART client")]
struct Cli {
    /// FHIR server base URL
    #[arg(long)]
    server: String,

    /// Resource path or search, e.g. "Patient/123" or "Observation?code=..."
    path: String,

    /// Bearer token to authorize with
    #[arg(long)]
    token: Option<String>,

    /// Dot-paths of references to resolve (repeatable)
    #[arg(long = "resolve")]
    resolve: Vec<String>,

    /// Number of Bundle pages to fetch
    #[arg(long, default_value_t = 1)]
    pages: i64,

    /// Flatten Bundle pages into a plain resource array
    #[arg(long)]
    flat: bool,

    /// Keep resolved references in a side channel instead of inlining them
    #[arg(long)]
    no_graph: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut state = SessionState::new(&cli.server);
    state.token_response.access_token = cli.token;
    let client = SmartClient::new(state).context("failed to create client")?;

    let options = FhirOptions {
        graph: !cli.no_graph,
        flat: cli.flat,
        page_limit: cli.pages,
        resolve_references: cli.resolve,
        ..Default::default()
    };

    match client.request(cli.path.as_str(), options).await? {
        FhirResult::Data(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        FhirResult::DataWithReferences { data, references } => {
            let combined = serde_json::json!({ "data": data, "references": references });
            println!("{}", serde_json::to_string_pretty(&combined)?);
        }
        FhirResult::None => {}
    }
    Ok(())
}
