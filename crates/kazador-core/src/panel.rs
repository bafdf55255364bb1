/// Outcome of one dashboard fetch: the value, or the message shown in its
/// place. The rest of the page keeps rendering either way.
#[derive(Debug, Clone, PartialEq)]
pub enum Panel<T> {
    Loaded(T),
    Failed(String),
}

impl<T> Panel<T> {
    #[tracing::instrument(skip(result))]
    pub fn from_result(label: &str, result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Self::Loaded(value),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(panel = label, error = %message, "panel failed to load");
                Self::Failed(message)
            }
        }
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Loaded(_) => None,
            Self::Failed(message) => Some(message),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Panel<U> {
        match self {
            Self::Loaded(value) => Panel::Loaded(f(value)),
            Self::Failed(message) => Panel::Failed(message),
        }
    }

    pub fn as_ref(&self) -> Panel<&T> {
        match self {
            Self::Loaded(value) => Panel::Loaded(value),
            Self::Failed(message) => Panel::Failed(message.clone()),
        }
    }
}
