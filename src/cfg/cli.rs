// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CONFIG_ENV: &str = "DNY_GATEWAY_CONFIG";

/// Resolves the config path from the first CLI argument, the
/// `DNY_GATEWAY_CONFIG` environment variable, or the given fallback.
pub fn resolve_config_path(fallback: &str) -> Result<PathBuf> {
    let rel = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| fallback.to_string());

    let p = Path::new(&rel);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
