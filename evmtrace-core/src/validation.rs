use crate::error::{EvmtraceError, Result};
use alloy_primitives::Address;
use std::path::Path;

/// Validate a contract address string (EIP-55 checksums are not enforced)
pub fn validate_contract_address(address: &str) -> Result<Address> {
    address.parse::<Address>().map_err(|e| {
        EvmtraceError::Config(format!("Invalid contract address '{}': {}", address, e))
    })
}

/// Validate that the ABI file exists and is a regular file
pub fn validate_abi_path(path: &str) -> Result<()> {
    let path = Path::new(path);

    if !path.exists() {
        return Err(EvmtraceError::Config(format!(
            "ABI file does not exist: {}",
            path.display()
        )));
    }

    if !path.is_file() {
        return Err(EvmtraceError::Config(format!(
            "ABI path is not a file: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Validate a database URL
pub fn validate_db_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(EvmtraceError::Config(
            "Database URL cannot be empty".to_string(),
        ));
    }

    if url.starts_with("sqlite:") {
        return Ok(());
    }

    let supported = ["postgres://", "postgresql://", "mongodb://", "mongodb+srv://"];
    if !supported.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(EvmtraceError::Config(format!(
            "Unsupported database URL '{}': expected sqlite:, postgres:// or mongodb://",
            url
        )));
    }

    // Connectivity is checked when the backend connects
    Ok(())
}

/// Validate an RPC URL
pub fn validate_rpc_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(EvmtraceError::Config("RPC URL cannot be empty".to_string()));
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(EvmtraceError::Config(format!(
            "Invalid RPC URL '{}': must start with http:// or https://",
            url
        )));
    }

    url::Url::parse(url)
        .map_err(|e| EvmtraceError::Config(format!("Invalid RPC URL '{}': {}", url, e)))?;

    Ok(())
}

pub fn validate_app_name(app_name: &str) -> Result<()> {
    if app_name.trim().is_empty() {
        return Err(EvmtraceError::Config(
            "Application name cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// The rescan interval must be strictly greater than the poll interval.
///
/// Checked whether or not rescanning is enabled.
pub fn validate_intervals(poll_interval_ms: u64, rescan_interval_ms: u64) -> Result<()> {
    if poll_interval_ms == 0 {
        return Err(EvmtraceError::Config(
            "Poll interval must be greater than 0".to_string(),
        ));
    }

    if rescan_interval_ms <= poll_interval_ms {
        return Err(EvmtraceError::Config(format!(
            "Rescan interval ({} ms) must be greater than poll interval ({} ms)",
            rescan_interval_ms, poll_interval_ms
        )));
    }

    Ok(())
}

/// Configuration validator for one-shot backfill
pub struct BackfillConfig {
    pub app_name: String,
    pub rpc_url: String,
    pub contract_address: String,
    pub abi_path: String,
    pub db_url: String,
    pub batch_size: u64,
    pub rpc_timeout_ms: u64,
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<()> {
        validate_app_name(&self.app_name)?;
        validate_rpc_url(&self.rpc_url)?;
        validate_contract_address(&self.contract_address)?;
        validate_abi_path(&self.abi_path)?;
        validate_db_url(&self.db_url)?;

        if self.batch_size == 0 {
            return Err(EvmtraceError::Config(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.rpc_timeout_ms == 0 {
            return Err(EvmtraceError::Config(
                "RPC timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration validator for the live tracker
pub struct LiveConfig {
    pub backfill: BackfillConfig,
    pub poll_interval_ms: u64,
    pub rescan_interval_ms: u64,
    pub rescan_window: u64,
    pub block_poll_interval_ms: u64,
}

impl LiveConfig {
    pub fn validate(&self) -> Result<()> {
        self.backfill.validate()?;
        validate_intervals(self.poll_interval_ms, self.rescan_interval_ms)?;

        if self.block_poll_interval_ms == 0 {
            return Err(EvmtraceError::Config(
                "Block watch interval must be greater than 0".to_string(),
            ));
        }

        if self.rescan_window == 0 {
            return Err(EvmtraceError::Config(
                "Rescan window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
