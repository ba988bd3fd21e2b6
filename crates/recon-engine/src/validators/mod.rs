//! Validators
//!
//! Each validator turns one comparison for one entity type into a
//! [`ValidationResult`](crate::models::ValidationResult). Data-quality findings
//! become `fail` results with discrepancies; a [`ValidationError`] is returned only
//! when the check could not reach a verdict.

pub mod completeness;
pub mod count;
pub mod hash;
pub mod schema;
pub mod tolerance;

pub use completeness::FieldCompletenessValidator;
pub use count::{variance, RowCountValidator};
pub use hash::{CanonicalHasher, HashChangeDetector};
pub use schema::{SchemaDriftDetector, SchemaFindings};
pub use tolerance::ToleranceChecker;

use futures::StreamExt;

use crate::error::ValidationError;
use crate::normalize::{NormalizedRecord, NormalizedStream};
use crate::source::Side;

/// A normalized stream that enforces strictly increasing record ids
///
/// Merge joins are only correct over sorted, duplicate-free input; a violation
/// aborts the check rather than producing a wrong diff.
pub(crate) struct KeyedStream {
    side: Side,
    inner: NormalizedStream,
    last: Option<String>,
    yielded: u64,
}

impl KeyedStream {
    pub(crate) fn new(side: Side, inner: NormalizedStream) -> Self {
        Self {
            side,
            inner,
            last: None,
            yielded: 0,
        }
    }

    pub(crate) async fn next(&mut self) -> Result<Option<NormalizedRecord>, ValidationError> {
        let Some(item) = self.inner.next().await else {
            return Ok(None);
        };
        let record = item?;

        if let Some(previous) = &self.last {
            match record.id.as_str().cmp(previous.as_str()) {
                std::cmp::Ordering::Greater => {},
                std::cmp::Ordering::Equal => {
                    return Err(ValidationError::DuplicateKey {
                        side: self.side,
                        key: record.id,
                    })
                },
                std::cmp::Ordering::Less => {
                    return Err(ValidationError::OrderViolation {
                        side: self.side,
                        previous: previous.clone(),
                        current: record.id,
                    })
                },
            }
        }

        self.last = Some(record.id.clone());
        self.yielded += 1;
        Ok(Some(record))
    }

    pub(crate) fn yielded(&self) -> u64 {
        self.yielded
    }
}
