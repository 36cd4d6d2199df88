//! # Policy Files
//!
//! Policies can be kept in a YAML (or JSON) file, either as a bare list or
//! under a top-level `policies:` key. Loading normalizes order ranks and runs
//! the same save-time validation the management API applies.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::PolicyId;

use crate::policy::{Policy, PolicyValidationError};

/// Failure to load a policy file.
#[derive(Error, Debug)]
pub enum PolicyFileError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The document is not a policy list.
    #[error("cannot parse policy document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A policy failed validation.
    #[error("policy {policy_id}: {source}")]
    Invalid {
        /// The offending policy.
        policy_id: PolicyId,
        /// What is wrong with it.
        source: PolicyValidationError,
    },

    /// Two policies share an id.
    #[error("duplicate policy id {0}")]
    DuplicateId(PolicyId),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    List(Vec<Policy>),
    Wrapped { policies: Vec<Policy> },
}

/// The policies declared in one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicyFile {
    /// Policies in file order.
    pub policies: Vec<Policy>,
}

impl PolicyFile {
    /// Parse a document. Does not validate.
    pub fn parse(text: &str) -> Result<Self, PolicyFileError> {
        let policies = match serde_yaml::from_str::<Document>(text)? {
            Document::List(policies) | Document::Wrapped { policies } => policies,
        };
        Ok(Self { policies })
    }

    /// Read and parse a file. Does not validate.
    pub fn read(path: &Path) -> Result<Self, PolicyFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Normalize every policy and collect every validation problem.
    pub fn check(&mut self) -> Vec<PolicyFileError> {
        let mut problems = Vec::new();
        let mut seen = BTreeSet::new();
        for policy in &mut self.policies {
            policy.normalize();
            if !seen.insert(policy.id.clone()) {
                problems.push(PolicyFileError::DuplicateId(policy.id.clone()));
            }
            if let Err(source) = policy.validate() {
                problems.push(PolicyFileError::Invalid {
                    policy_id: policy.id.clone(),
                    source,
                });
            }
        }
        problems
    }

    /// Normalized, validated policies, or the first problem found.
    pub fn into_validated(mut self) -> Result<Vec<Policy>, PolicyFileError> {
        match self.check().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(self.policies),
        }
    }

    /// Render as YAML under a `policies:` key.
    pub fn to_yaml(&self) -> Result<String, PolicyFileError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
