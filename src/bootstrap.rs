//! Cold start: log on, enter the lobby, get into a game and wait for it to
//! begin.
//!
//! [`SessionBootstrapper::run`] performs the whole sequence:
//!
//! 1. log on through an [`Authenticator`] and obtain a session token;
//! 2. make sure the server license is accepted ([`LicenseStore`]);
//! 3. connect the lobby with the token and enter it;
//! 4. load computer accounts, host information and the full games listing;
//! 5. create a game or pick an existing one ([`GamePlan`]);
//! 6. connect the game host and join;
//! 7. send the game init commands (`INFO`, `MOVEABLE`, `READY +`);
//! 8. turn the seats beyond `human_seats` into computer seats;
//! 9. wait until the published snapshot reports the game as started.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actions::GameActions;
use crate::error::{Result, TriviaError};
use crate::error_codes::{GameCreationResultCode, LoginErrorKind};
use crate::host::HostClient;
use crate::listeners::{ConnectionListener, TracingListener};
use crate::lobby::LobbyClient;
use crate::protocol::{
    AccountSettings, GameInfo, GameRules, GameSettings, HostInfo, JoinDescriptor, PackageKey, Role,
    ServerAppSettings, Sex, ANY_NAME,
};
use crate::session::{ConnectOutcome, SessionManager};
use crate::snapshot::GameSnapshot;

/// Default bound on the wait for the game to start.
pub const DEFAULT_GAME_START_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Lobby hub path below the server URI.
pub const LOBBY_PATH: &str = "sionline";

/// Game host hub path below a host URI.
pub const HOST_PATH: &str = "sihost";

const LOG_ON_PATH: &str = "api/Account/LogOn";
const DEFAULT_SHOWMAN_NAME: &str = "Showman";

// ── Authentication ──────────────────────────────────────────────────

/// Exchanges credentials for a session token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TriviaError::Login`] with the typed refusal reason.
    async fn log_on(&self, server_uri: &str, login: &str, password: &str) -> Result<String>;
}

/// [`Authenticator`] posting a form to `{server}/api/Account/LogOn`. The
/// response body is the token.
#[derive(Debug, Clone, Default)]
pub struct HttpAuthenticator {
    client: Client,
}

impl HttpAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn log_on(&self, server_uri: &str, login: &str, password: &str) -> Result<String> {
        let url = join_path(server_uri, LOG_ON_PATH)?;
        debug!(%url, login, "logging on");

        let response = self
            .client
            .post(url)
            .form(&[("login", login), ("password", password)])
            .send()
            .await
            .map_err(|e| TriviaError::Login {
                kind: LoginErrorKind::CannotReachServer,
                detail: Some(e.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TriviaError::Login {
                kind: LoginErrorKind::from_status(status.as_u16()),
                detail: Some(status.to_string()),
            });
        }

        response.text().await.map_err(|e| TriviaError::Login {
            kind: LoginErrorKind::CannotReachServer,
            detail: Some(e.to_string()),
        })
    }
}

// ── License ─────────────────────────────────────────────────────────

/// Remembers which servers' licenses were accepted.
pub trait LicenseStore: Send + Sync {
    fn is_accepted(&self, server_uri: &str) -> bool;
    fn accept(&self, server_uri: &str);
}

/// In-process [`LicenseStore`].
#[derive(Debug, Default)]
pub struct MemoryLicenseStore {
    accepted: Mutex<HashSet<String>>,
}

impl MemoryLicenseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LicenseStore for MemoryLicenseStore {
    fn is_accepted(&self, server_uri: &str) -> bool {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(server_uri)
    }

    fn accept(&self, server_uri: &str) {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_uri.to_string());
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Settings of a game created by the bootstrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGameOptions {
    pub game_name: String,
    pub password: String,
    pub package: PackageKey,
    pub rules: GameRules,
    /// Total player seats. Defaults to **3**.
    pub player_seats: usize,
    /// Seats kept for humans, this client included. Defaults to **1**.
    pub human_seats: usize,
    pub allow_viewers: bool,
    pub is_private: bool,
}

impl NewGameOptions {
    pub fn new(game_name: impl Into<String>, package: PackageKey) -> Self {
        Self {
            game_name: game_name.into(),
            password: String::new(),
            package,
            rules: GameRules::NONE,
            player_seats: 3,
            human_seats: 1,
            allow_viewers: true,
            is_private: false,
        }
    }

    #[must_use]
    pub fn with_seats(mut self, player_seats: usize, human_seats: usize) -> Self {
        self.player_seats = player_seats;
        self.human_seats = human_seats.min(player_seats);
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: GameRules) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }
}

/// An existing game to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinExisting {
    pub game_id: i32,
    /// Host serving the game. Looked up in the games listing when absent.
    pub host_uri: Option<String>,
    pub password: Option<String>,
    pub pin: Option<i32>,
}

impl JoinExisting {
    pub fn new(game_id: i32) -> Self {
        Self {
            game_id,
            host_uri: None,
            password: None,
            pin: None,
        }
    }

    #[must_use]
    pub fn with_host_uri(mut self, host_uri: impl Into<String>) -> Self {
        self.host_uri = Some(host_uri.into());
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_pin(mut self, pin: i32) -> Self {
        self.pin = Some(pin);
        self
    }
}

/// How the bootstrapper gets into a game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GamePlan {
    Create(NewGameOptions),
    Join(JoinExisting),
}

/// Bootstrap settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// HTTP(S) base URI of the server.
    pub server_uri: String,
    pub login: String,
    pub password: String,
    /// Lobby culture. Defaults to **"en-US"**.
    pub culture: String,
    pub sex: Sex,
    pub role: Role,
    pub plan: GamePlan,
    /// Accept an unaccepted server license instead of failing. Defaults to
    /// **true**.
    pub accept_license: bool,
    /// Defaults to **10 minutes**.
    pub game_start_timeout: Duration,
}

impl BootstrapConfig {
    pub fn new(server_uri: impl Into<String>, login: impl Into<String>, plan: GamePlan) -> Self {
        Self {
            server_uri: server_uri.into(),
            login: login.into(),
            password: String::new(),
            culture: "en-US".to_string(),
            sex: Sex::Male,
            role: Role::Player,
            plan,
            accept_license: true,
            game_start_timeout: DEFAULT_GAME_START_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = culture.into();
        self
    }

    #[must_use]
    pub fn with_sex(mut self, sex: Sex) -> Self {
        self.sex = sex;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_accept_license(mut self, accept: bool) -> Self {
        self.accept_license = accept;
        self
    }

    #[must_use]
    pub fn with_game_start_timeout(mut self, timeout: Duration) -> Self {
        self.game_start_timeout = timeout;
        self
    }

    /// Game settings for [`GamePlan::Create`].
    pub fn game_settings(&self, options: &NewGameOptions) -> GameSettings {
        let me = AccountSettings {
            name: self.login.clone(),
            is_human: true,
            is_male: self.sex.is_male(),
        };
        let any_seat = || AccountSettings {
            name: ANY_NAME.to_string(),
            is_human: true,
            is_male: false,
        };

        let showman = if self.role == Role::Showman {
            me.clone()
        } else {
            AccountSettings {
                name: DEFAULT_SHOWMAN_NAME.to_string(),
                is_human: false,
                is_male: false,
            }
        };
        let players = (0..options.player_seats)
            .map(|seat| {
                if seat == 0 && self.role == Role::Player {
                    me.clone()
                } else {
                    any_seat()
                }
            })
            .collect();
        let viewers = if self.role == Role::Viewer { vec![me] } else { vec![] };

        GameSettings {
            human_player_name: self.login.clone(),
            network_game_name: options.game_name.trim().to_string(),
            network_game_password: options.password.clone(),
            is_private: options.is_private,
            allow_viewers: options.allow_viewers,
            showman,
            players,
            viewers,
            app_settings: ServerAppSettings::from_rules(options.rules, self.culture.clone()),
        }
    }
}

// ── URIs ────────────────────────────────────────────────────────────

fn join_path(base: &str, path: &str) -> Result<Url> {
    let base = base.trim();
    let joined = if base.ends_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    Url::parse(&joined).map_err(|e| TriviaError::InvalidInput(format!("bad server URI {base:?}: {e}")))
}

/// WebSocket URI of the hub at `path` below `base`, with an optional session
/// token in the query. `http` becomes `ws` and `https` becomes `wss`.
///
/// # Errors
///
/// Returns [`TriviaError::InvalidInput`] when `base` is not an absolute URI.
pub fn endpoint_uri(base: &str, path: &str, token: Option<&str>) -> Result<String> {
    let mut url = join_path(base, path)?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|()| TriviaError::InvalidInput(format!("cannot switch {base:?} to {scheme}")))?;
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.into())
}

// ── Bootstrapper ────────────────────────────────────────────────────

/// Everything the bootstrap produced.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub lobby: LobbyClient,
    pub host: HostClient,
    pub actions: GameActions<HostClient>,
    pub game_id: i32,
    pub computer_accounts: Vec<String>,
    pub host_info: HostInfo,
    pub games: Vec<GameInfo>,
    /// Lobby users, sorted.
    pub users: Vec<String>,
    pub news: Option<String>,
}

/// Drives the cold-start sequence.
pub struct SessionBootstrapper {
    config: BootstrapConfig,
    session: Arc<SessionManager>,
    authenticator: Arc<dyn Authenticator>,
    licenses: Arc<dyn LicenseStore>,
}

impl SessionBootstrapper {
    pub fn new(config: BootstrapConfig, session: Arc<SessionManager>) -> Self {
        Self {
            config,
            session,
            authenticator: Arc::new(HttpAuthenticator::new()),
            licenses: Arc::new(MemoryLicenseStore::new()),
        }
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    #[must_use]
    pub fn with_license_store(mut self, licenses: Arc<dyn LicenseStore>) -> Self {
        self.licenses = licenses;
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Run the full sequence. `host_listener` receives the host's events and
    /// is expected to publish into `snapshots`.
    ///
    /// # Errors
    ///
    /// Fails with the first error of any step, or with
    /// [`TriviaError::GameStartTimeout`] when the game does not start in time.
    pub async fn run(
        &self,
        host_listener: Arc<dyn ConnectionListener>,
        mut snapshots: watch::Receiver<GameSnapshot>,
    ) -> Result<BootstrapOutcome> {
        let config = &self.config;

        let token = self
            .authenticator
            .log_on(&config.server_uri, &config.login, &config.password)
            .await?;
        info!(login = %config.login, "logged on");

        self.ensure_license()?;

        let lobby = self.enter_lobby(&token).await?;
        let computer_accounts = lobby.get_computer_accounts(&config.culture).await?;
        let host_info = lobby.get_host_info(&config.culture).await?;
        let games = lobby.get_all_games().await?;
        let mut users = lobby.get_users().await?;
        users.sort();
        let news = lobby.get_news().await?.filter(|n| !n.is_empty());
        info!(
            server = %host_info.name,
            computer_accounts = computer_accounts.len(),
            games = games.len(),
            users = users.len(),
            "lobby ready"
        );

        let (game_id, host_base) = match &config.plan {
            GamePlan::Create(options) => self.create_game(&lobby, options).await?,
            GamePlan::Join(existing) => (existing.game_id, self.host_for(existing, &games)),
        };

        let host_uri = endpoint_uri(&host_base, HOST_PATH, None)?;
        let handle = self.session.connect_to_host(&host_uri, host_listener).await?;
        let host = HostClient::new(handle.clone());
        self.session.join(&handle, self.descriptor(game_id)).await?.into_result()?;

        let actions = GameActions::new(host.clone());
        actions.info().await?;
        actions.moveable().await?;
        if matches!(config.role, Role::Player | Role::Showman) {
            actions.ready(true).await?;
        }

        if let GamePlan::Create(options) = &config.plan {
            for seat in options.human_seats..options.player_seats {
                actions.change_player_type(seat).await?;
            }
            debug!(
                computer_seats = options.player_seats.saturating_sub(options.human_seats),
                "computer seats provisioned"
            );
        }

        info!(game_id, timeout = ?config.game_start_timeout, "waiting for game start");
        match tokio::time::timeout(
            config.game_start_timeout,
            snapshots.wait_for(|s| s.is_game_started),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(TriviaError::TransportClosed),
            Err(_) => {
                warn!(game_id, "game did not start in time");
                return Err(TriviaError::GameStartTimeout(config.game_start_timeout));
            }
        }
        info!(game_id, "game started");

        Ok(BootstrapOutcome {
            lobby,
            host,
            actions,
            game_id,
            computer_accounts,
            host_info,
            games,
            users,
            news,
        })
    }

    fn ensure_license(&self) -> Result<()> {
        let server = &self.config.server_uri;
        if self.licenses.is_accepted(server) {
            return Ok(());
        }
        if !self.config.accept_license {
            return Err(TriviaError::LicenseNotAccepted);
        }
        debug!(server, "accepting server license");
        self.licenses.accept(server);
        Ok(())
    }

    async fn enter_lobby(&self, token: &str) -> Result<LobbyClient> {
        let uri = endpoint_uri(&self.config.server_uri, LOBBY_PATH, Some(token))?;
        let handle = match self
            .session
            .connect_lobby(&uri, Arc::new(TracingListener::new("lobby")))
            .await?
        {
            ConnectOutcome::Connected(handle) => handle,
            ConnectOutcome::AuthenticationRequired => return Err(TriviaError::AuthenticationRequired),
            ConnectOutcome::Failed(reason) => return Err(TriviaError::Connect(reason)),
        };

        let lobby = LobbyClient::new(handle);
        lobby.join_lobby(&self.config.culture).await?;
        Ok(lobby)
    }

    async fn create_game(&self, lobby: &LobbyClient, options: &NewGameOptions) -> Result<(i32, String)> {
        let settings = self.config.game_settings(options);
        let result = lobby
            .create_and_join_game(&settings, &options.package, self.config.sex.is_male())
            .await?;

        let message = result.error_message.filter(|m| !m.is_empty());
        if !result.code.is_ok() || message.is_some() {
            let code = if result.code.is_ok() {
                GameCreationResultCode::UnknownError
            } else {
                result.code
            };
            return Err(TriviaError::GameCreation { code, message });
        }

        info!(game_id = result.game_id, name = %options.game_name, "game created");
        let host_base = result
            .host_uri
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.config.server_uri.clone());
        Ok((result.game_id, host_base))
    }

    fn host_for(&self, existing: &JoinExisting, games: &[GameInfo]) -> String {
        existing
            .host_uri
            .clone()
            .or_else(|| {
                games
                    .iter()
                    .find(|g| g.game_id == existing.game_id)
                    .and_then(|g| g.host_uri.clone())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.config.server_uri.clone())
    }

    fn descriptor(&self, game_id: i32) -> JoinDescriptor {
        let config = &self.config;
        let mut descriptor = JoinDescriptor::new(game_id, config.login.clone(), config.role, config.sex);
        match &config.plan {
            GamePlan::Create(options) if !options.password.is_empty() => {
                descriptor = descriptor.with_password(options.password.clone());
            }
            GamePlan::Join(existing) => {
                if let Some(password) = &existing.password {
                    descriptor = descriptor.with_password(password.clone());
                }
                if let Some(pin) = existing.pin {
                    descriptor = descriptor.with_pin(pin);
                }
            }
            GamePlan::Create(_) => {}
        }
        descriptor
    }
}

impl std::fmt::Debug for SessionBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBootstrapper")
            .field("server_uri", &self.config.server_uri)
            .field("login", &self.config.login)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn lobby_uri_switches_scheme_and_carries_token() {
        let uri = endpoint_uri("https://trivia.example/", LOBBY_PATH, Some("a b&c")).unwrap();
        assert_eq!(uri, "wss://trivia.example/sionline?token=a+b%26c");

        let uri = endpoint_uri("http://localhost:5000", LOBBY_PATH, Some("t")).unwrap();
        assert_eq!(uri, "ws://localhost:5000/sionline?token=t");
    }

    #[test]
    fn host_uri_has_no_query() {
        let uri = endpoint_uri("http://host.example/games/", HOST_PATH, None).unwrap();
        assert_eq!(uri, "ws://host.example/games/sihost");
        let uri = endpoint_uri("ws://already.ws", HOST_PATH, None).unwrap();
        assert_eq!(uri, "ws://already.ws/sihost");
    }

    #[test]
    fn relative_base_is_rejected() {
        assert!(matches!(
            endpoint_uri("not a uri", LOBBY_PATH, None),
            Err(TriviaError::InvalidInput(_))
        ));
    }

    #[test]
    fn license_store_remembers_per_server() {
        let store = MemoryLicenseStore::new();
        assert!(!store.is_accepted("http://a"));
        store.accept("http://a");
        assert!(store.is_accepted("http://a"));
        assert!(!store.is_accepted("http://b"));
    }

    #[test]
    fn player_takes_first_seat_and_others_stay_open() {
        let options = NewGameOptions::new("  quiz night ", PackageKey::random()).with_seats(3, 1);
        let config = BootstrapConfig::new("http://s", "alice", GamePlan::Create(options.clone()));
        let settings = config.game_settings(&options);

        assert_eq!(settings.network_game_name, "quiz night");
        assert_eq!(settings.players.len(), 3);
        assert_eq!(settings.players[0].name, "alice");
        assert!(settings.players.iter().all(|p| p.is_human));
        assert_eq!(settings.players[1].name, ANY_NAME);
        assert!(!settings.showman.is_human);
        assert!(settings.viewers.is_empty());
    }

    #[test]
    fn showman_role_takes_the_showman_seat() {
        let options = NewGameOptions::new("g", PackageKey::random()).with_seats(2, 0);
        let config = BootstrapConfig::new("http://s", "bob", GamePlan::Create(options.clone()))
            .with_role(Role::Showman);
        let settings = config.game_settings(&options);

        assert_eq!(settings.showman.name, "bob");
        assert!(settings.showman.is_human);
        assert!(settings.players.iter().all(|p| p.name == ANY_NAME));
    }

    #[test]
    fn join_descriptor_carries_password_and_pin() {
        let plan = GamePlan::Join(JoinExisting::new(7).with_password("pw").with_pin(1234));
        let bootstrapper = SessionBootstrapper::new(
            BootstrapConfig::new("http://s", "carol", plan).with_sex(Sex::Female),
            Arc::new(SessionManager::new(Arc::new(NeverConnector))),
        );
        let descriptor = bootstrapper.descriptor(7);
        assert_eq!(descriptor.password.as_deref(), Some("pw"));
        assert_eq!(descriptor.pin, Some(1234));
        assert_eq!(descriptor.sex, Sex::Female);
    }

    #[test]
    fn join_host_falls_back_to_listing_then_server() {
        let plan = GamePlan::Join(JoinExisting::new(2));
        let bootstrapper = SessionBootstrapper::new(
            BootstrapConfig::new("http://server", "dan", plan),
            Arc::new(SessionManager::new(Arc::new(NeverConnector))),
        );
        let listed: GameInfo = serde_json::from_value(serde_json::json!({
            "GameID": 2,
            "GameName": "g",
            "HostUri": "http://other/"
        }))
        .unwrap();

        let GamePlan::Join(existing) = &bootstrapper.config().plan else {
            panic!("join plan expected");
        };
        assert_eq!(bootstrapper.host_for(existing, &[listed]), "http://other/");
        assert_eq!(bootstrapper.host_for(existing, &[]), "http://server");
    }

    struct NeverConnector;

    #[async_trait]
    impl crate::transport::Connector for NeverConnector {
        async fn connect(&self, _uri: &str) -> Result<Box<dyn crate::transport::Transport>> {
            Err(TriviaError::Connect("offline".into()))
        }
    }
}
