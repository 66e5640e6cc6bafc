use std::convert::TryFrom;
use tokio::time::Duration;

/// Timeouts of the client side request queues. Unset fields take the defaults listed on each
/// field.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// A request that hasn't completed after this long fails on its own. Default 2 minutes.
    pub request_timeout: Option<Duration>,
    /// A backend that sent nothing for this long is considered gone. Default 30 seconds.
    pub backend_aliveness_timeout: Option<Duration>,
    /// A queue that closed nothing for this long fails everything and is dropped. Default 15
    /// minutes.
    pub no_progress_timeout: Option<Duration>,
    /// Pause between backend resolution attempts that timed out. Default 5 seconds.
    pub resolve_retry: Option<Duration>,
    /// Assumed request duration until the backend has answered something. Default 500ms.
    pub default_ticks_per_task: Option<Duration>,
    /// Open requests per connection at which every submitter waits the full default delay.
    /// Default 4 000.
    pub queue_depth: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct ClientOptionsValidated {
    pub(crate) request_timeout: Duration,
    pub(crate) backend_aliveness_timeout: Duration,
    pub(crate) no_progress_timeout: Duration,
    pub(crate) resolve_retry: Duration,
    pub(crate) default_ticks_per_task: Duration,
    pub(crate) queue_depth: usize,
}

impl ClientOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.request_timeout == Duration::from_secs(0) {
            return Err("Request timeout must be positive");
        }
        if self.backend_aliveness_timeout == Duration::from_secs(0) {
            return Err("Backend aliveness timeout must be positive");
        }
        if self.no_progress_timeout < self.request_timeout {
            return Err("No progress timeout must not be shorter than the request timeout");
        }
        if self.queue_depth < 2 {
            return Err("Queue depth must be at least 2");
        }

        Ok(())
    }
}

impl TryFrom<ClientOptions> for ClientOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ClientOptions) -> Result<Self, Self::Error> {
        let values = ClientOptionsValidated {
            request_timeout: options.request_timeout.unwrap_or(Duration::from_secs(120)),
            backend_aliveness_timeout: options.backend_aliveness_timeout.unwrap_or(Duration::from_secs(30)),
            no_progress_timeout: options.no_progress_timeout.unwrap_or(Duration::from_secs(15 * 60)),
            resolve_retry: options.resolve_retry.unwrap_or(Duration::from_secs(5)),
            default_ticks_per_task: options.default_ticks_per_task.unwrap_or(Duration::from_millis(500)),
            queue_depth: options.queue_depth.unwrap_or(4000),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = ClientOptionsValidated::try_from(ClientOptions::default()).unwrap();
        assert_eq!(options.no_progress_timeout, Duration::from_secs(900));
        assert_eq!(options.queue_depth, 4000);
    }

    #[test]
    fn no_progress_timeout_covers_request_timeout() {
        let result = ClientOptionsValidated::try_from(ClientOptions {
            request_timeout: Some(Duration::from_secs(60)),
            no_progress_timeout: Some(Duration::from_secs(30)),
            ..ClientOptions::default()
        });
        assert!(result.is_err());
    }
}
