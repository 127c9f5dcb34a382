use crate::Error;

/// StreamItem is the unit flowing between the stages of an ordered pipeline. The `index` is the
/// zero-based arrival position assigned once at ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem<T> {
    pub index: u64,
    /// absent only when the transform failed without producing a value, or for the terminal
    /// cancellation item.
    pub value: Option<T>,
    pub error: Option<Error>,
}

impl<T> StreamItem<T> {
    pub(crate) fn ingested(index: u64, value: T) -> Self {
        Self {
            index,
            value: Some(value),
            error: None,
        }
    }

    pub(crate) fn cancelled(index: u64) -> Self {
        Self {
            index,
            value: None,
            error: Some(Error::Cancelled),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Carries a failed item across a stage whose output type differs, the value cannot follow.
    pub(crate) fn without_value<U>(self) -> StreamItem<U> {
        StreamItem {
            index: self.index,
            value: None,
            error: self.error,
        }
    }

    pub fn into_result(self) -> crate::Result<T> {
        match (self.error, self.value) {
            (Some(e), _) => Err(e),
            (None, Some(v)) => Ok(v),
            (None, None) => Err(Error::Transform(format!(
                "record at index {} has no value",
                self.index
            ))),
        }
    }
}

/// TransformFailure is the error half of a transform's result. Transforms may hand back the value
/// they were working on together with the error, it travels downstream attached to the error.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformFailure<T> {
    pub value: Option<T>,
    pub error: Error,
}

impl<T> TransformFailure<T> {
    pub fn with_value(value: T, error: Error) -> Self {
        Self {
            value: Some(value),
            error,
        }
    }
}

impl<T> From<Error> for TransformFailure<T> {
    fn from(error: Error) -> Self {
        Self { value: None, error }
    }
}

pub type TransformResult<T> = std::result::Result<T, TransformFailure<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_prefers_error() {
        let item = StreamItem {
            index: 3,
            value: Some(33),
            error: Some(Error::Transform("boom".into())),
        };
        assert_eq!(item.into_result(), Err(Error::Transform("boom".into())));
        assert_eq!(StreamItem::ingested(0, 7).into_result(), Ok(7));
    }

    #[test]
    fn failure_from_error_has_no_value() {
        let failure: TransformFailure<u32> = Error::Transform("bad input".into()).into();
        assert!(failure.value.is_none());
    }
}
