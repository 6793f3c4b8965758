//! Import-identifier to installable-package resolution.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Failure to map an import to something installable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not resolve package for import {import}: {reason}")]
pub struct ResolveError {
    pub import: String,
    pub reason: String,
}

/// Maps an import identifier to the package name the installer understands.
pub trait PackageResolver: Send + Sync {
    fn resolve(&self, import: &str) -> Result<String, ResolveError>;
}

/// Imports whose distribution name differs from the module name.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("sklearn", "scikit-learn"),
    ("skimage", "scikit-image"),
    ("PIL", "pillow"),
    ("cv2", "opencv-python-headless"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
    ("fitz", "pymupdf"),
    ("Crypto", "pycryptodome"),
    ("jwt", "pyjwt"),
    ("serial", "pyserial"),
    ("magic", "python-magic"),
    ("OpenSSL", "pyopenssl"),
    ("google", "protobuf"),
    ("attr", "attrs"),
    ("pkg_resources", "setuptools"),
    ("Levenshtein", "python-levenshtein"),
    ("MySQLdb", "mysqlclient"),
    ("psycopg2", "psycopg2-binary"),
];

fn package_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static regex"))
}

/// Table-driven resolver: explicit aliases first, then (optionally) the import
/// name itself.
#[derive(Debug, Clone)]
pub struct StaticPackageResolver {
    aliases: HashMap<String, String>,
    identity_fallback: bool,
}

impl Default for StaticPackageResolver {
    fn default() -> Self {
        Self {
            aliases: BUILTIN_ALIASES
                .iter()
                .map(|(import, package)| (import.to_string(), package.to_string()))
                .collect(),
            identity_fallback: true,
        }
    }
}

impl StaticPackageResolver {
    /// Only the alias table; unknown imports fail to resolve.
    pub fn strict() -> Self {
        Self {
            identity_fallback: false,
            ..Self::default()
        }
    }

    /// Add or override an alias (builder pattern).
    pub fn with_alias(mut self, import: impl Into<String>, package: impl Into<String>) -> Self {
        self.aliases.insert(import.into(), package.into());
        self
    }

    pub fn with_identity_fallback(mut self, enabled: bool) -> Self {
        self.identity_fallback = enabled;
        self
    }
}

impl PackageResolver for StaticPackageResolver {
    fn resolve(&self, import: &str) -> Result<String, ResolveError> {
        let candidate = match self.aliases.get(import) {
            Some(package) => package.clone(),
            None if self.identity_fallback => import.to_string(),
            None => {
                return Err(ResolveError {
                    import: import.to_string(),
                    reason: "no known package provides this module".to_string(),
                })
            }
        };

        if !package_name_re().is_match(&candidate) {
            return Err(ResolveError {
                import: import.to_string(),
                reason: format!("{candidate:?} is not a valid package name"),
            });
        }
        Ok(candidate)
    }
}
