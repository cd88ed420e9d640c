#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate implementing the core of an OBD-II / EOBD conformance tester: the part of a
//! scan tool test that finds out which OBD protocol a vehicle speaks, then exchanges
//! diagnostic requests with its ECUs while checking every response against the
//! timing and format rules of the standards.
//!
//! ## Protocol determination
//!
//! [Session::determine_protocol] walks the candidate protocols of a [ScanTable]
//! (US, EU or EU with 250K CAN only), rotating the order between runs. Each candidate
//! is connected and probed with SID 01 PID 00. Exactly one protocol may answer: the
//! headers seen on the first connect form a [ConnectFingerprint], and reconnecting the
//! protocol found must reproduce it. 29bit CAN candidates first discover the physical
//! addresses of the ECUs so flow control filters can be installed for each of them.
//!
//! ## Request engine
//!
//! [Session::execute] sends one [ServiceRequest] and collects every response until the
//! receive window closes. Responses are classified by the legacy (J1850 / K-line) or
//! the segmented (ISO 15765) rules, stored per ECU in a [ResponseStore], and every
//! violation found is graded with a [Verdict]:
//!
//! * [Verdict::Pass] - Conformant
//! * [Verdict::Errors] - Usable, but a timing or format rule was broken
//! * [Verdict::Fail] - Not usable
//! * [Verdict::Retry] - The ECUs asked to repeat the request
//!
//! ## Hardware support
//!
//! The tester drives any [hardware::Adapter]. SAE J2534 (Passthru) adapters are
//! supported with the `passthru` feature, and [hardware::simulation] provides a
//! scripted vehicle for testing.
//!
//! NOTE: Although the J2534 API is officially only for Windows, it will also compile for UNIX and OSX operating
//! systems, due to the unofficial porting of the API in the [Macchina-J2534 project](https://github.com/rnd-ash/Macchina-J2534)
//!

use channel::ChannelError;
use hardware::HardwareError;

pub mod channel;
pub mod config;
pub mod engine;
pub mod events;
pub mod fingerprint;
pub mod hardware;
pub mod helpers;
pub mod nrc;
pub mod prober;
pub mod protocol;
pub mod request;
pub mod session;
pub mod store;
pub mod timing;
pub mod verdict;

pub use config::{DelayConfig, TesterConfig};
pub use events::{EventHandler, EventLog, TesterEvent};
pub use fingerprint::ConnectFingerprint;
pub use protocol::{ProtocolCatalog, ProtocolTag, ScanTable};
pub use request::{RequestFlags, ServiceRequest};
pub use session::Session;
pub use store::ResponseStore;
pub use verdict::Verdict;

/// Tester result
pub type TesterResult<T> = Result<T, TesterError>;

#[derive(Debug, thiserror::Error)]
/// Tester error
///
/// Errors are the failures of the tester itself. Misbehaviour of the vehicle
/// is never an error, it is reported as a [Verdict]
pub enum TesterError {
    /// Error with underlying communication channel
    #[error("Tester channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
    /// Device hardware error
    #[error("Tester hardware error")]
    HardwareError(
        #[from]
        #[source]
        HardwareError,
    ),
    /// Response store error
    #[error("Response store error")]
    StoreError(
        #[from]
        #[source]
        store::StoreError,
    ),
    /// A request could not be turned into a frame
    #[error("Request frame error")]
    FrameError(
        #[from]
        #[source]
        request::FrameError,
    ),
}
