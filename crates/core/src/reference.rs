//! Opaque references to data owned by external collaborators.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Pointer to the staged input batch (e.g. an object-store key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordBatchRef(String);

/// Pointer to the inference output the result writer commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRef(String);

macro_rules! impl_reference {
    ($t:ident, $name:literal) => {
        impl $t {
            pub fn new(location: impl Into<String>) -> Result<Self, DomainError> {
                let location = location.into();
                if location.trim().is_empty() {
                    return Err(DomainError::validation(concat!(
                        $name,
                        ": location must not be empty"
                    )));
                }
                Ok(Self(location))
            }

            pub fn location(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

impl_reference!(RecordBatchRef, "RecordBatchRef");
impl_reference!(OutputRef, "OutputRef");
