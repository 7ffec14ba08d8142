use std::panic::{self, AssertUnwindSafe};

use crate::error::BoxError;

#[cfg(feature = "smithy")]
pub use smithy_state::{StorableOption, extract_service_operation};

/// Runs user-supplied code, logging and discarding both returned errors and panics.
pub fn safe_execute<T>(hook_name: &str, f: impl FnOnce() -> Result<T, BoxError>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            log::error!("aws-sdk instrumentation: {hook_name} error: {err}");
            None
        }
        Err(_) => {
            log::error!("aws-sdk instrumentation: {hook_name} panicked");
            None
        }
    }
}

#[cfg(feature = "smithy")]
mod smithy_state {
    use std::ops::{Deref, DerefMut};

    use aws_smithy_runtime_api::client::orchestrator::Metadata;
    use aws_smithy_types::config_bag::{ConfigBag, Storable, StoreReplace};

    // Interceptor state slot that can be taken out of the ConfigBag between hooks.
    #[derive(Debug)]
    pub struct StorableOption<T: core::fmt::Debug>(Option<T>);

    impl<T: core::fmt::Debug + Send + Sync + 'static> Storable for StorableOption<T> {
        type Storer = StoreReplace<Self>;
    }
    impl<T: core::fmt::Debug> Default for StorableOption<T> {
        fn default() -> Self {
            Self(None)
        }
    }

    impl<T: core::fmt::Debug> StorableOption<T> {
        pub fn new(content: T) -> Self {
            Self(Some(content))
        }
    }

    impl<T: core::fmt::Debug> Deref for StorableOption<T> {
        type Target = Option<T>;
        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
    impl<T: core::fmt::Debug> DerefMut for StorableOption<T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    /// `(service, operation)` of the call being orchestrated, when the client set them.
    pub fn extract_service_operation(cfg: &ConfigBag) -> Option<(&str, &str)> {
        cfg.load::<Metadata>()
            .map(|metadata| (metadata.service(), metadata.name()))
    }
}
