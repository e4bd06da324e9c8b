//! Binary entrypoint that wires the haul services together and runs until
//! interrupted.

use haul_app::{AppResult, run_app};

/// Boots haul and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
