//! # Dream Mock
//!
//! In-process interception plane for tests: register interceptors under a
//! base URI and every dispatch to that base (or its children) is answered
//! by the mock instead of a production endpoint. Two modes share the
//! registration surface:
//!
//! - **unordered setups** ([`MockPlane::setup`]): candidates score each
//!   incoming request additively and the best match answers; candidates
//!   may carry a [`Times`] rule and be verified.
//! - **ordered expectations** ([`MockPlane::automock`]): calls must arrive
//!   in the registered order; mismatches and excess calls fail
//!   [`AutoMock::wait_and_verify`].
//!
//! ```rust,no_run
//! use dream_core::{Message, Plug, Uri};
//! use dream_mock::{global_plane, Times};
//!
//! # async fn example() -> dream_core::Result<()> {
//! let base = Uri::parse("http://billing/")?;
//! let charge = global_plane()
//!     .setup(&base)
//!     .verb(dream_core::Method::POST)
//!     .at(&["charges"])
//!     .times(Times::Once)
//!     .returns(Message::from_document(serde_json::json!({"id": "ch_1"})))?;
//!
//! let response = Plug::parse("http://billing/charges")?
//!     .post_document(serde_json::json!({"amount": 100}))
//!     .await?;
//! assert!(response.is_success());
//! charge.try_verify()?;
//! # Ok(())
//! # }
//! ```

mod automock;
mod plane;
mod setup;

pub use automock::{AutoMock, ExcessCall};
pub use plane::{global_plane, MockPlane, SetupBuilder, MOCK_SCORE};
pub use setup::{MockSetup, Times, VerifyOutcome};
