//! # warden-cli: Operator Command-Line Interface
//!
//! Provides the `warden` binary for working with policy files offline.
//!
//! ## Subcommands
//!
//! - `warden validate`: normalize and validate policy files.
//! - `warden simulate`: dispatch one event against a policy file in an
//!   in-memory engine and report matches, the action plan, and (with
//!   `--execute`) what each action did.
//! - `warden schema`: print an example policy document.
//!
//! ```bash
//! warden validate policies/*.yaml
//! warden simulate --policies policies/finance.yaml --subject emp-42 \
//!     --department Finance --kind risk-updated --risk-score 85 --execute
//! ```
//!
//! Exit codes: 0 success, 1 validation failure, 2 operational error.

pub mod schema;
pub mod simulate;
pub mod validate;
