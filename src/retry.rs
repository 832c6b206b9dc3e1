use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{extractor::ExtractorError, options::DownloadOptions};

const FALLBACK_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

/// Retries transient extractor failures, rotating through browser
/// User-Agents when the caller did not pin one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Duration,
    profiles: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            profiles: FALLBACK_USER_AGENTS.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn options_for_attempt(&self, base: &DownloadOptions, attempt: usize) -> DownloadOptions {
        let pinned_user_agent = base
            .http_headers()
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"));

        if attempt == 0 || pinned_user_agent || self.profiles.is_empty() {
            return base.clone();
        }

        let mut options = base.clone();
        options.user_agent = Some(self.profiles[(attempt - 1) % self.profiles.len()].clone());
        options
    }

    /// Linear backoff, saturating instead of overflowing.
    fn delay_for(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.backoff.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    pub async fn run<T, F, Fut>(&self, base: &DownloadOptions, mut op: F) -> Result<T, ExtractorError>
    where
        F: FnMut(DownloadOptions) -> Fut,
        Fut: Future<Output = Result<T, ExtractorError>>,
    {
        let mut attempt = 0;

        loop {
            let options = self.options_for_attempt(base, attempt);
            match op(options).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < self.max_attempts && error.is_transient() => {
                    attempt += 1;
                    warn!(
                        "attempt {attempt}/{} for {:?} failed, retrying: {error}",
                        self.max_attempts, base.url
                    );
                    tokio::time::sleep(self.delay_for(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::options::RequestParams;

    fn options(user_agent: Option<&str>) -> DownloadOptions {
        DownloadOptions::from_params(RequestParams {
            url: Some("https://example.com/v".to_string()),
            user_agent: user_agent.map(ToString::to_string),
            ..Default::default()
        })
        .unwrap()
    }

    fn forbidden() -> ExtractorError {
        ExtractorError::from_stderr(b"ERROR: HTTP Error 403: Forbidden")
    }

    #[test]
    fn rotates_profiles_after_first_attempt() {
        let policy = RetryPolicy::new(5, Duration::ZERO)
            .with_profiles(vec!["a".to_string(), "b".to_string()]);
        let base = options(None);

        assert_eq!(policy.options_for_attempt(&base, 0).user_agent, None);
        assert_eq!(policy.options_for_attempt(&base, 1).user_agent.as_deref(), Some("a"));
        assert_eq!(policy.options_for_attempt(&base, 2).user_agent.as_deref(), Some("b"));
        assert_eq!(policy.options_for_attempt(&base, 3).user_agent.as_deref(), Some("a"));
    }

    #[test]
    fn keeps_caller_user_agent() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let base = options(Some("mine"));
        assert_eq!(policy.options_for_attempt(&base, 2).user_agent.as_deref(), Some("mine"));
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let policy = RetryPolicy::new(3, Duration::from_millis(750));
        assert_eq!(policy.delay_for(1), Duration::from_millis(750));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));

        let huge = RetryPolicy::new(3, Duration::from_millis(u64::MAX));
        assert_eq!(huge.delay_for(2), Duration::MAX);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(3, Duration::ZERO).with_profiles(vec!["fallback".to_string()]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = policy
            .run(&options(None), |attempt_options| {
                let seen = Arc::clone(&seen);
                async move {
                    let mut seen = seen.lock().unwrap();
                    seen.push(attempt_options.user_agent.clone());
                    if seen.len() < 2 { Err(forbidden()) } else { Ok(seen.len()) }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("fallback".to_string())]
        );
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let calls = Arc::new(Mutex::new(0));

        let result: Result<(), _> = policy
            .run(&options(None), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(forbidden())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let calls = Arc::new(Mutex::new(0));

        let result: Result<(), _> = policy
            .run(&options(None), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(ExtractorError::from_stderr(b"ERROR: Unsupported URL: x"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
