//! SMART on FHIR REST Client
//!
//! This crate provides the request pipeline for applications authorized
//! through a SMART on FHIR launch: Authorization-header injection,
//! single-flight refresh-token renewal on 401, depth-ordered cross-resource
//! reference resolution with fetch deduplication, and paginated Bundle
//! accumulation, all behind one `request` call.
//!
//! # Examples
//!
//! ## Fetch a resource and inline its references
//!
//! ```rust,no_run
//! use funke_smart_client::{FhirOptions, SessionState, SmartClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SmartClient::new(SessionState::new("https://fhir.example.org/r4"))?;
//! let options = FhirOptions {
//!     resolve_references: vec!["subject".into(), "performer".into()],
//!     ..Default::default()
//! };
//! let observation = client.request("Observation/1", options).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Walk two pages of a search result
//!
//! ```rust,no_run
//! use funke_smart_client::{FhirOptions, SessionState, SmartClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SmartClient::new(SessionState::new("https://fhir.example.org/r4"))?;
//! let options = FhirOptions { page_limit: 2, flat: true, ..Default::default() };
//! let observations = client.request("Observation?code=4548-4", options).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod options;
pub mod resolve;
pub mod state;

pub use auth::authorization_header;
pub use client::SmartClient;
pub use error::{Error, Result};
pub use options::{FhirOptions, FhirResult, PageCallback, RequestSpec};
pub use resolve::ReferenceCache;
pub use state::{MemoryStorage, SessionState, SessionStorage, TokenResponse};

// Re-export the cancellation token so callers do not need a direct
// tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
