// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Resolves the router config path from `DTN_ROUTER_CONFIG`, falling back
/// to `default_rel` relative to the working directory.
pub fn config_path_from_env_or(default_rel: &str) -> Result<PathBuf> {
    match std::env::var("DTN_ROUTER_CONFIG") {
        Ok(path) if !path.is_empty() => resolve_config_path(&path),
        _ => resolve_config_path(default_rel),
    }
}
