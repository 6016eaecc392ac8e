//! Writes the call relay's OpenAPI document.
//!
//! Usage: `openapi [OUTPUT]`, defaulting to `openapi.json` in the working directory.

use callrelay_api::router::ApiDoc;
use std::path::PathBuf;
use utoipa::OpenApi;

const DEFAULT_OUTPUT: &str = "openapi.json";

fn write_document(
    api_doc: utoipa::openapi::OpenApi,
    path: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let document = api_doc.to_pretty_json()?;
    std::fs::write(path, document)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    write_document(ApiDoc::openapi(), &output)?;
    println!("Wrote {}", output.display());
    Ok(())
}
