// src/telemetry.rs
use metrics::{counter, histogram};
use std::time::Instant;

use crate::{Amount, AssetCode, LedgerError};

pub const OPERATIONS_TOTAL: &str = "ledger.operations.total";
pub const OPERATION_DURATION: &str = "ledger.operation.duration_seconds";
pub const AMOUNT_DIGITS: &str = "ledger.amount.digits";

pub(crate) fn record_outcome<T>(
    operation: &'static str,
    started: Instant,
    result: &Result<T, LedgerError>,
) {
    let status = match result {
        Ok(_) => "success",
        Err(err) => err.kind(),
    };

    counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
    histogram!(OPERATION_DURATION, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Big integers do not fit an `f64` exactly; record their magnitude instead.
pub(crate) fn record_amount(asset: &AssetCode, amount: &Amount) {
    histogram!(AMOUNT_DIGITS, "asset" => asset.to_string()).record(amount.digits() as f64);
}
