//! Finding a portable package waiting to be imported.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::kv::keys;
use crate::model::PORTABLE_PACKAGE_TYPE;

use super::Migrator;

/// Query parameter that carries a package on the launch URL.
pub const PORTABLE_PARAM: &str = "portable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PackageSource {
    UrlParam,
    Store,
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UrlParam => "url parameter",
            Self::Store => "key-value store",
        })
    }
}

/// A package document with a recognized type tag, not yet imported.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPackage {
    pub source: PackageSource,
    pub package: Value,
}

/// Why a candidate was passed over.
enum Rejected {
    Malformed(serde_json::Error),
    WrongType,
}

fn parse_candidate(raw: &str) -> Result<Value, Rejected> {
    let value: Value = serde_json::from_str(raw).map_err(Rejected::Malformed)?;
    if value.get("type").and_then(Value::as_str) == Some(PORTABLE_PACKAGE_TYPE) {
        Ok(value)
    } else {
        Err(Rejected::WrongType)
    }
}

impl Migrator {
    /// Looks for a package, first in `url_query` (a `portable=` parameter,
    /// percent-encoded), then under the reserved store key.
    ///
    /// The first valid package wins. Malformed candidates are logged and
    /// skipped; a malformed stored package is also removed.
    pub fn detect_portable_package(&self, url_query: Option<&str>) -> Option<DetectedPackage> {
        if let Some(query) = url_query {
            let query = query.strip_prefix('?').unwrap_or(query);
            for (name, raw) in url::form_urlencoded::parse(query.as_bytes()) {
                if name != PORTABLE_PARAM {
                    continue;
                }
                match parse_candidate(&raw) {
                    Ok(package) => {
                        return Some(DetectedPackage {
                            source: PackageSource::UrlParam,
                            package,
                        });
                    }
                    Err(Rejected::Malformed(e)) => warn!(error = %e, "malformed package in url"),
                    Err(Rejected::WrongType) => warn!("url parameter is not a portable package"),
                }
            }
        }

        let stored = match self.store.get(keys::PORTABLE_PACKAGE) {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(error = %e, "could not read stored package");
                return None;
            }
        };
        match parse_candidate(&stored) {
            Ok(package) => Some(DetectedPackage {
                source: PackageSource::Store,
                package,
            }),
            Err(Rejected::Malformed(e)) => {
                warn!(error = %e, "malformed stored package, removing it");
                if let Err(e) = self.store.remove(keys::PORTABLE_PACKAGE) {
                    debug!(error = %e, "could not remove malformed package");
                }
                None
            }
            Err(Rejected::WrongType) => {
                warn!("stored value is not a portable package");
                None
            }
        }
    }
}
