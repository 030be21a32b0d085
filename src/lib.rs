//! # eghlt
//!
//! Analysis tools for CMS Phase-II e/gamma HLT trigger studies: per-event
//! Monte-Carlo normalisation weights for pT-hat-binned QCD/minimum-bias
//! mixtures, a small accessor-chain language for binding named object fields
//! to output columns at runtime, and flat Parquet ntuple output.
//!
//! The two central pieces are:
//!
//! * [`weights::QcdWeightCalc`] — stitches pT-hat-binned QCD samples and the
//!   inclusive minimum-bias sample into a consistently normalised mixture,
//!   correcting for pileup double-counting across bins and for
//!   electromagnetic generator-filter efficiencies.
//! * [`accessor`] — parses chains like `var("hltEgammaHoverE",0)` or
//!   `eventAuxiliary().run()` into a step list once, then resolves them
//!   against any object implementing [`accessor::FieldAccess`].
//!
//! Event data enters through [`data::EventBank`], a name-keyed bank of
//! per-event products (trigger candidates, generator particles, pileup
//! summaries), mirroring the retrievable-collection model of the upstream
//! event framework without depending on its formats.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// Accessor-chain parsing and resolution, plus the [`UnaryFunc`] wrapper.
pub mod accessor;
/// Named per-event products and the physics-object adapters they hold.
pub mod data;
/// Flat-ntuple column binding and Parquet output.
pub mod ntuple;
/// MC sample weights: QCD/minbias stitching and flat by-name lookups.
pub mod weights;

pub use crate::accessor::{resolve, AccessorStep, ArgValue, FieldAccess, FieldValue, UnaryFunc};
pub use crate::data::{
    EgTrigObj, EventAux, EventBank, GenFilterDecision, GenInfo, GenParticle, PileupSummary,
    Product,
};
pub use crate::ntuple::{ColumnType, FlatNtuple};
pub use crate::weights::{EvtWeights, QcdWeightCalc, SampleBin, WeightCatalog};

pub type EgHltResult<T> = Result<T, EgHltError>;

/// The error type used by all `eghlt` internal methods
#[derive(Error, Debug)]
pub enum EgHltError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An accessor-chain segment that is neither an attribute, a call, nor a
    /// call with a literal argument list.
    #[error("Malformed accessor: segment \"{segment}\" of \"{chain}\" is not an attribute or call")]
    MalformedAccessor {
        /// The full chain being parsed
        chain: String,
        /// The segment which failed to parse
        segment: String,
    },
    /// An accessor step which names a member the target object does not have.
    #[error("\"{type_name}\" has no attribute or method \"{segment}\"")]
    UnresolvedAccessor {
        /// Concrete type of the object the step was applied to
        type_name: String,
        /// The member name which failed lookup
        segment: String,
    },
    /// A resolved method which failed while executing with its coerced
    /// arguments; carries the rendered call for context.
    #[error("Invoking {call} failed: {source}")]
    Invocation {
        /// The call as written, e.g. `var("hltEgammaHoverE", 0)`
        call: String,
        /// The underlying failure
        source: Box<EgHltError>,
    },
    /// A by-name event product lookup which found nothing.
    #[error("No product named \"{name}\" in the event")]
    MissingProduct {
        /// Name of the requested product
        name: String,
    },
    /// A by-name event product lookup which found a product of another kind.
    #[error("Product \"{name}\" is not a \"{expected}\"")]
    ProductType {
        /// Name of the requested product
        name: String,
        /// The kind the caller asked for
        expected: &'static str,
    },
    /// A value which cannot be stored in an ntuple column of the declared type.
    #[error("Column \"{name}\" cannot hold a {datatype} value")]
    InvalidColumnValue {
        /// Name of the column being filled
        name: String,
        /// Kind of the offending value
        datatype: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to
    /// warrant their own error category.
    #[error("{0}")]
    Custom(String),
}
