use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};

use super::netatmo::{ApiError, StationApi};
use super::store::{AuthorizationPrompt, TokenStore};
use super::token::{ClientCredentials, Credentials, TokenPair, TokenState};
use super::{Observation, ObservationSource, SensorError};
use crate::unix_now;

/// Netatmo-backed observation reader.
///
/// Token renewal happens under the state lock, so concurrent callers that all
/// find the token stale wait for one refresh instead of issuing their own.
pub struct ObservationReader {
    client: ClientCredentials,
    sensor_id: Option<String>,
    state: Mutex<TokenState>,
    api: Arc<dyn StationApi>,
    store: Arc<dyn TokenStore>,
    prompt: Arc<dyn AuthorizationPrompt>,
}

impl ObservationReader {
    pub fn new(
        credentials: Credentials,
        sensor_id: Option<String>,
        api: Arc<dyn StationApi>,
        store: Arc<dyn TokenStore>,
        prompt: Arc<dyn AuthorizationPrompt>,
    ) -> Self {
        let (client, state) = credentials.into_parts();
        log::info!(
            "observation reader: client={} sensor={} token_state={}",
            client.client_id,
            sensor_id.as_deref().unwrap_or("<first station>"),
            state.name()
        );
        Self {
            client,
            sensor_id: sensor_id.filter(|id| !id.trim().is_empty()),
            state: Mutex::new(state),
            api,
            store,
            prompt,
        }
    }

    /// Current token state, for diagnostics.
    pub fn token_state(&self) -> TokenState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn usable_token(&self) -> Result<String, SensorError> {
        let mut state = self.lock_state();
        *state = std::mem::take(&mut *state).observe_expiry(unix_now());
        if let Some(token) = state.access_token() {
            return Ok(token.to_string());
        }
        log::info!("access token unusable ({}); renewing", state.name());
        self.renew(&mut state)
    }

    fn recover_from_rejection(&self, rejected: &str) -> Result<String, SensorError> {
        let mut state = self.lock_state();
        *state = std::mem::take(&mut *state).reject(rejected);
        // Another reader may have renewed while this one waited on the lock.
        if let Some(token) = state.access_token() {
            return Ok(token.to_string());
        }
        log::warn!("access token rejected by station API; renewing");
        self.renew(&mut state)
    }

    fn renew(&self, state: &mut TokenState) -> Result<String, SensorError> {
        let previous_refresh = state.refresh_token().map(str::to_string);
        let pair = match previous_refresh.as_deref() {
            Some(refresh_token) => match self.api.refresh(&self.client, refresh_token) {
                Ok(pair) => pair.or_refresh(previous_refresh.clone()),
                Err(ApiError::InvalidGrant(detail)) => {
                    log::warn!("refresh token no longer valid ({}); reauthorizing", detail);
                    self.reauthorize()?
                }
                Err(e) => return Err(SensorError::Refresh(e)),
            },
            None => {
                log::warn!("no refresh token available; reauthorizing");
                self.reauthorize()?
            }
        };

        let access = pair.access_token.clone();
        *state = TokenState::Authorized(pair.clone());
        self.store
            .persist(&pair)
            .map_err(|e| SensorError::Persist(format!("{:#}", e)))?;
        Ok(access)
    }

    fn reauthorize(&self) -> Result<TokenPair, SensorError> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let url = self
            .api
            .authorize_url(&self.client, &nonce)
            .map_err(|e| SensorError::Authorization(e.to_string()))?;
        let code = self
            .prompt
            .authorization_code(&url)
            .map_err(|e| SensorError::Authorization(format!("{:#}", e)))?;
        let pair = self
            .api
            .exchange_code(&self.client, &code)
            .map_err(|e| SensorError::Authorization(format!("code exchange failed: {}", e)))?;
        log::info!("reauthorization complete");
        Ok(pair)
    }

    fn fetch(&self, access_token: &str) -> Result<Observation, ApiError> {
        let body = self.api.stations_data(access_token)?;
        body.observation(self.sensor_id.as_deref())
            .map_err(ApiError::Malformed)
    }
}

impl ObservationSource for ObservationReader {
    fn read(&self) -> Result<Observation, SensorError> {
        let token = self.usable_token()?;
        let result = match self.fetch(&token) {
            Err(ApiError::Unauthorized) => {
                let renewed = self.recover_from_rejection(&token)?;
                match self.fetch(&renewed) {
                    Err(ApiError::Unauthorized) => return Err(SensorError::Rejected),
                    other => other,
                }
            }
            other => other,
        };
        result.map_err(|e| match e {
            ApiError::Malformed(detail) => SensorError::NoReading(detail),
            other => SensorError::Fetch(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::netatmo::StationsBody;
    use crate::sensor::store::MemoryTokenStore;
    use crate::sensor::token::tests::jwt;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stale() -> String {
        jwt(r#"{"exp": 1000}"#)
    }

    fn fresh(tag: &str) -> String {
        jwt(&format!(
            r#"{{"exp": {}, "jti": "{}"}}"#,
            unix_now() as u64 + 3600,
            tag
        ))
    }

    fn station_body() -> StationsBody {
        serde_json::from_str(
            r#"{"devices": [{"_id": "s1", "dashboard_data":
                {"Temperature": 12.0, "Humidity": 80, "Pressure": 1001.5}}]}"#,
        )
        .expect("station body")
    }

    #[derive(Default)]
    struct FakeApi {
        refresh_results: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
        fetch_results: Mutex<VecDeque<Result<StationsBody, ApiError>>>,
        exchange_results: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
        fetch_tokens: Mutex<Vec<String>>,
        refresh_calls: AtomicUsize,
        exchange_calls: AtomicUsize,
        refresh_delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeApi {
        fn refreshing(self, result: Result<TokenPair, ApiError>) -> Self {
            self.refresh_results.lock().unwrap().push_back(result);
            self
        }

        fn fetching(self, result: Result<StationsBody, ApiError>) -> Self {
            self.fetch_results.lock().unwrap().push_back(result);
            self
        }

        fn exchanging(self, result: Result<TokenPair, ApiError>) -> Self {
            self.exchange_results.lock().unwrap().push_back(result);
            self
        }
    }

    impl StationApi for FakeApi {
        fn authorize_url(&self, _: &ClientCredentials, state: &str) -> Result<String, ApiError> {
            Ok(format!("https://auth.test/authorize?state={}", state))
        }

        fn exchange_code(&self, _: &ClientCredentials, code: &str) -> Result<TokenPair, ApiError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(code, "code-123");
            self.exchange_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TokenPair::new(fresh("exchanged"), Some("r-ex".into()))))
        }

        fn refresh(&self, _: &ClientCredentials, _: &str) -> Result<TokenPair, ApiError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.refresh_delay {
                std::thread::sleep(delay);
            }
            let result = self
                .refresh_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TokenPair::new(fresh("refreshed"), Some("r2".into()))));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn stations_data(&self, access_token: &str) -> Result<StationsBody, ApiError> {
            self.fetch_tokens
                .lock()
                .unwrap()
                .push(access_token.to_string());
            self.fetch_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(station_body()))
        }
    }

    #[derive(Default)]
    struct FakePrompt {
        urls: Mutex<Vec<String>>,
        refuse: bool,
    }

    impl AuthorizationPrompt for FakePrompt {
        fn authorization_code(&self, auth_url: &str) -> anyhow::Result<String> {
            self.urls.lock().unwrap().push(auth_url.to_string());
            if self.refuse {
                return Err(anyhow!("no authorization code entered"));
            }
            Ok("code-123".to_string())
        }
    }

    struct FailingStore;

    impl TokenStore for FailingStore {
        fn persist(&self, _: &TokenPair) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    fn credentials(access: Option<String>, refresh: Option<&str>) -> Credentials {
        Credentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost/cb".into(),
            access_token: access,
            refresh_token: refresh.map(str::to_string),
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        store: Arc<MemoryTokenStore>,
        prompt: Arc<FakePrompt>,
        reader: ObservationReader,
    }

    fn harness(creds: Credentials, api: FakeApi, prompt: FakePrompt) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(MemoryTokenStore::new());
        let prompt = Arc::new(prompt);
        let reader = ObservationReader::new(
            creds,
            None,
            api.clone(),
            store.clone(),
            prompt.clone(),
        );
        Harness {
            api,
            store,
            prompt,
            reader,
        }
    }

    #[test]
    fn valid_token_is_used_without_refresh() {
        let token = fresh("current");
        let h = harness(
            credentials(Some(token.clone()), Some("r1")),
            FakeApi::default(),
            FakePrompt::default(),
        );
        let obs = h.reader.read().expect("observation");
        assert_eq!(obs.temperature, 12.0);
        assert_eq!(obs.pressure, 1001.5);
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(*h.api.fetch_tokens.lock().unwrap(), vec![token]);
        assert!(h.store.saved().is_empty());
    }

    #[test]
    fn expired_token_is_refreshed_and_persisted() {
        let renewed = fresh("renewed");
        let api = FakeApi::default().refreshing(Ok(TokenPair::new(renewed.clone(), None)));
        let h = harness(
            credentials(Some(stale()), Some("r1")),
            api,
            FakePrompt::default(),
        );

        h.reader.read().expect("observation");
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.api.fetch_tokens.lock().unwrap(), vec![renewed.clone()]);
        // Unrotated refresh token carries over.
        assert_eq!(
            h.store.saved(),
            vec![TokenPair::new(renewed, Some("r1".into()))]
        );
    }

    #[test]
    fn unauthorized_fetch_refreshes_and_retries_once() {
        let old = fresh("old");
        let api = FakeApi::default().fetching(Err(ApiError::Unauthorized));
        let h = harness(
            credentials(Some(old.clone()), Some("r1")),
            api,
            FakePrompt::default(),
        );

        h.reader.read().expect("observation after retry");
        let tokens = h.api.fetch_tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], old);
        assert_ne!(tokens[1], old);
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_rejection_gives_up_for_the_cycle() {
        let api = FakeApi::default()
            .fetching(Err(ApiError::Unauthorized))
            .fetching(Err(ApiError::Unauthorized));
        let h = harness(
            credentials(Some(fresh("a")), Some("r1")),
            api,
            FakePrompt::default(),
        );

        let err = h.reader.read().expect_err("rejected twice");
        assert!(matches!(err, SensorError::Rejected));
        assert!(!err.is_fatal());
        assert_eq!(h.api.fetch_tokens.lock().unwrap().len(), 2);
    }

    #[test]
    fn invalid_grant_triggers_reauthorization() {
        let api = FakeApi::default()
            .refreshing(Err(ApiError::InvalidGrant(r#"{"error":"invalid_grant"}"#.into())));
        let h = harness(
            credentials(Some(stale()), Some("revoked")),
            api,
            FakePrompt::default(),
        );

        h.reader.read().expect("observation after reauthorization");
        assert_eq!(h.api.exchange_calls.load(Ordering::SeqCst), 1);
        let urls = h.prompt.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("state="));
        let saved = h.store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].refresh_token.as_deref(), Some("r-ex"));
        assert!(matches!(h.reader.token_state(), TokenState::Authorized(_)));
    }

    #[test]
    fn missing_refresh_token_goes_straight_to_authorization() {
        let h = harness(
            credentials(None, None),
            FakeApi::default(),
            FakePrompt::default(),
        );
        h.reader.read().expect("observation");
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.api.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_authorization_is_fatal() {
        let prompt = FakePrompt {
            refuse: true,
            ..FakePrompt::default()
        };
        let h = harness(credentials(None, None), FakeApi::default(), prompt);
        let err = h.reader.read().expect_err("no code");
        assert!(err.is_fatal());
        assert!(h.api.fetch_tokens.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_exchange_is_fatal() {
        let api = FakeApi::default()
            .exchanging(Err(ApiError::InvalidGrant("code already used".into())));
        let h = harness(credentials(None, None), api, FakePrompt::default());
        let err = h.reader.read().expect_err("exchange refused");
        assert!(matches!(err, SensorError::Authorization(_)));
    }

    #[test]
    fn transient_refresh_failure_is_retried_next_cycle() {
        let api = FakeApi::default().refreshing(Err(ApiError::Transport("timed out".into())));
        let h = harness(
            credentials(Some(stale()), Some("r1")),
            api,
            FakePrompt::default(),
        );

        let err = h.reader.read().expect_err("refresh down");
        assert!(matches!(err, SensorError::Refresh(_)));
        assert!(!err.is_fatal());

        h.reader.read().expect("second cycle succeeds");
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persist_failure_keeps_the_renewed_token_in_memory() {
        let api = Arc::new(FakeApi::default());
        let reader = ObservationReader::new(
            credentials(Some(stale()), Some("r1")),
            None,
            api.clone(),
            Arc::new(FailingStore),
            Arc::new(FakePrompt::default()),
        );

        let err = reader.read().expect_err("persist fails");
        assert!(matches!(err, SensorError::Persist(_)));
        assert!(!err.is_fatal());

        reader.read().expect("renewed token still usable");
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_dashboard_data_is_no_reading() {
        let api = FakeApi::default().fetching(Ok(StationsBody::default()));
        let h = harness(
            credentials(Some(fresh("a")), Some("r1")),
            api,
            FakePrompt::default(),
        );
        let err = h.reader.read().expect_err("empty body");
        assert!(matches!(err, SensorError::NoReading(_)));
    }

    #[test]
    fn concurrent_readers_share_one_refresh() {
        let api = Arc::new(FakeApi {
            refresh_delay: Some(Duration::from_millis(50)),
            ..FakeApi::default()
        });
        let reader = Arc::new(ObservationReader::new(
            credentials(Some(stale()), Some("r1")),
            None,
            api.clone(),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(FakePrompt::default()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || reader.read())
            })
            .collect();
        for handle in handles {
            handle.join().expect("reader thread").expect("observation");
        }

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
        let tokens = api.fetch_tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 8);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }
}
