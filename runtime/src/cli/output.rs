// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Machine-readable output helpers.

use serde::Serialize;

/// Pretty-print a value as JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!("failed to serialize output: {e}"),
    }
}

/// One compact JSON document per line.
pub fn print_json_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!("failed to serialize output: {e}"),
    }
}
