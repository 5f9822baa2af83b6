// src/cli/handlers/version.rs

use crate::{
    CancellationToken,
    constants::{APP_NAME, VERSION},
};
use anyhow::Result;

pub fn handle(
    _stage: Option<String>,
    _args: Vec<String>,
    _cancellation_token: &CancellationToken,
) -> Result<i32> {
    println!("{} {}", APP_NAME, VERSION);
    Ok(0)
}
