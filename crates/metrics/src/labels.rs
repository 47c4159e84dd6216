use std::borrow::Cow;

/// Standard label set for metrics carrying only a status dimension.
pub static STATUS_LABEL: [&str; 1] = ["status"];

/// A single metric label pair. Keys are static; values may be computed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: Cow<'static, str>,
}

impl MetricLabel {
    pub const STATUS_ERROR: MetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("error"),
    };
    pub const STATUS_SUCCESS: MetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("success"),
    };

    pub fn new(key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn status(is_ok: bool) -> Self {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub(crate) fn as_pair(&self) -> (&str, &str) {
        (self.key, self.value.as_ref())
    }
}
