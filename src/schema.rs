//! Credential schema documents.
//!
//! A schema definition event carries a JSON document describing the tree of
//! credential classes: who may issue each class, what each class may issue
//! in turn, and the expiry and revocation policy per class.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Literal issuer entry naming the schema authority itself.
pub const ROOT_ISSUER: &str = "root";

/// Parsed content of a schema definition event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDoc {
    /// Credential classes keyed by class id.
    pub classes: BTreeMap<String, ClassDef>,
}

/// One credential class inside a schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassDef {
    /// Human label.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Classes this credential may issue; empty means terminal.
    pub scope: Vec<String>,
    /// Who may issue this class: class ids, or the literal `"root"`.
    pub issued_by: Vec<String>,
    pub expiry: ExpiryPolicy,
    /// If revoked, downstream grants issued afterwards are invalid too.
    pub cascade_revoke: bool,
    /// Reserved for schema-defined extensions.
    #[serde(default)]
    pub constraints: serde_json::Map<String, serde_json::Value>,
}

/// Validity-window policy for a class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiryPolicy {
    /// Upper bound on the validity window in days; `null` allows perpetual.
    pub max_days: Option<u64>,
    pub renewable: bool,
}

impl SchemaDoc {
    /// Parse a schema document from event content.
    pub fn parse(content: &str) -> Result<Self, String> {
        let doc: SchemaDoc =
            serde_json::from_str(content).map_err(|e| format!("schema content: {}", e))?;
        doc.check()?;
        Ok(doc)
    }

    /// Internal-consistency check: non-empty classes, every scope member
    /// and every non-root issuer resolves within `classes`.
    pub fn check(&self) -> Result<(), String> {
        if self.classes.is_empty() {
            return Err("schema defines no classes".into());
        }
        for (id, class) in &self.classes {
            for member in &class.scope {
                if !self.classes.contains_key(member) {
                    return Err(format!(
                        "class {} scope references unknown class {}",
                        id, member
                    ));
                }
            }
            if class.issued_by.is_empty() {
                return Err(format!("class {} has empty issued_by", id));
            }
            for issuer in &class.issued_by {
                if issuer != ROOT_ISSUER && !self.classes.contains_key(issuer) {
                    return Err(format!(
                        "class {} issued_by references unknown class {}",
                        id, issuer
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn class(&self, id: &str) -> Option<&ClassDef> {
        self.classes.get(id)
    }
}

impl ClassDef {
    /// Whether the schema authority may issue this class directly.
    pub fn root_issuable(&self) -> bool {
        self.issued_by.iter().any(|i| i == ROOT_ISSUER)
    }
}
