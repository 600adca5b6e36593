// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Route classification.

use serde::{Deserialize, Serialize};

fn default_protected() -> Vec<String> {
    vec!["/edicion".to_string(), "/temario".to_string(), "/placas".to_string()]
}

fn default_public() -> Vec<String> {
    vec!["/".to_string(), "/home".to_string()]
}

fn default_landing() -> String {
    "/".to_string()
}

/// Which paths need a valid session. A prefix matches itself and anything
/// below it (`/placas`, `/placas/12`), never a sibling (`/placasx`).
/// Every path that is not protected is public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default = "default_protected")]
    pub protected: Vec<String>,
    /// Known public pages. Informational; unlisted paths are public too.
    #[serde(default = "default_public")]
    pub public: Vec<String>,
    #[serde(default = "default_landing")]
    pub landing: String,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            protected: default_protected(),
            public: default_public(),
            landing: default_landing(),
        }
    }
}

impl RouteTable {
    pub fn is_protected(&self, path: &str) -> bool {
        let path = strip_query(path);
        self.protected.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            path == prefix
                || path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn is_public(&self, path: &str) -> bool {
        !self.is_protected(path)
    }

    pub fn landing(&self) -> &str {
        &self.landing
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}
