//! Local session: the signing secret, the profile set up for it, the
//! pubkey → role bindings and the unread watermark.
//!
//! Everything lives in one directory and is written atomically. The secret
//! is only ever read back by this process; it is never sent anywhere.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    keys::{KeyError, Keys},
    tagging::Role,
};

const SECRET_FILE: &str = "secret";
const PROFILE_FILE: &str = "profile.json";
const BINDINGS_FILE: &str = "role_bindings.json";
const UNREAD_FILE: &str = "unread_since";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage: {0}")]
    Io(#[from] io::Error),
    #[error("session file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("this key is registered as a {bound}; it cannot act as a {requested}")]
    RoleBound { bound: Role, requested: Role },
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

/// Locally held profile for the active key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub pubkey: String,
    pub role: Role,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bio: String,
}

/// Fields collected by the profile setup step.
#[derive(Debug, Clone, Default)]
pub struct ProfileInput {
    pub username: String,
    pub bio: String,
    pub role: Role,
}

/// An authenticated user: keys plus profile.
#[derive(Debug, Clone)]
pub struct Session {
    pub keys: Keys,
    pub profile: Profile,
}

impl Session {
    pub fn role(&self) -> Role {
        self.profile.role
    }

    pub fn pubkey(&self) -> &str {
        &self.profile.pubkey
    }
}

/// Authentication state machine.
#[derive(Debug, Clone)]
pub enum AuthState {
    Unauthenticated,
    /// Keys generated, profile not yet chosen.
    ProfileSetup { keys: Keys },
    Authenticated(Session),
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "signed out",
            AuthState::ProfileSetup { .. } => "setting up a profile",
            AuthState::Authenticated(_) => "signed in",
        }
    }

    fn refuse(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            action,
            state: self.name(),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    /// Unauthenticated → ProfileSetup with a fresh keypair.
    pub fn generate_keys(self) -> Result<AuthState, SessionError> {
        match self {
            AuthState::Unauthenticated => Ok(AuthState::ProfileSetup {
                keys: Keys::generate(),
            }),
            other => Err(other.refuse("generate keys")),
        }
    }

    /// ProfileSetup → Authenticated, binding the key to the chosen role.
    pub fn complete_setup(
        self,
        store: &SessionStore,
        input: ProfileInput,
    ) -> Result<AuthState, SessionError> {
        let keys = match self {
            AuthState::ProfileSetup { keys } => keys,
            other => return Err(other.refuse("complete setup")),
        };
        let pubkey = keys.public_hex();
        store.bind_role(&pubkey, input.role)?;
        let profile = Profile {
            pubkey,
            role: input.role,
            username: input.username.trim().to_string(),
            bio: input.bio.trim().to_string(),
        };
        store.save(&keys, &profile)?;
        info!(pubkey = %profile.pubkey, role = %profile.role, "profile created");
        Ok(AuthState::Authenticated(Session { keys, profile }))
    }

    /// Unauthenticated → Authenticated with a pasted secret.
    ///
    /// A stored profile for the same key is reused; otherwise a minimal one
    /// is created with `role`, the key's bound role, or `student`.
    pub fn login(
        self,
        store: &SessionStore,
        secret: &str,
        role: Option<Role>,
    ) -> Result<AuthState, SessionError> {
        if !matches!(self, AuthState::Unauthenticated) {
            return Err(self.refuse("log in"));
        }
        let keys = Keys::from_secret_hex(secret)?;
        let pubkey = keys.public_hex();
        let bound = store.bound_role(&pubkey)?;
        let stored = store.load_profile()?.filter(|p| p.pubkey == pubkey);
        let role = role
            .or(bound)
            .or(stored.as_ref().map(|p| p.role))
            .unwrap_or_default();
        store.bind_role(&pubkey, role)?;
        let profile = match stored {
            Some(profile) if profile.role == role => profile,
            _ => Profile {
                pubkey,
                role,
                username: String::new(),
                bio: String::new(),
            },
        };
        store.save(&keys, &profile)?;
        info!(pubkey = %profile.pubkey, role = %profile.role, "logged in");
        Ok(AuthState::Authenticated(Session { keys, profile }))
    }

    /// Any state → Unauthenticated, clearing secret, profile and watermark.
    /// Role bindings survive.
    pub fn logout(self, store: &SessionStore) -> Result<AuthState, SessionError> {
        store.clear()?;
        Ok(AuthState::Unauthenticated)
    }
}

/// Directory-backed persistence for [`AuthState`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Restore the persisted state; a missing secret or profile means
    /// signed out.
    pub fn load(&self) -> Result<AuthState, SessionError> {
        let Some(secret) = self.read(SECRET_FILE)? else {
            return Ok(AuthState::Unauthenticated);
        };
        let keys = Keys::from_secret_hex(&secret)?;
        match self.load_profile()? {
            Some(profile) if profile.pubkey == keys.public_hex() => {
                Ok(AuthState::Authenticated(Session { keys, profile }))
            }
            _ => Ok(AuthState::Unauthenticated),
        }
    }

    pub fn load_profile(&self) -> Result<Option<Profile>, SessionError> {
        self.read(PROFILE_FILE)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    fn save(&self, keys: &Keys, profile: &Profile) -> Result<(), SessionError> {
        self.write(SECRET_FILE, keys.secret_hex().as_bytes())?;
        self.write(PROFILE_FILE, &serde_json::to_vec_pretty(profile)?)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        for name in [SECRET_FILE, PROFILE_FILE, UNREAD_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        debug!(dir = %self.dir.display(), "session cleared");
        Ok(())
    }

    fn bindings(&self) -> Result<BTreeMap<String, Role>, SessionError> {
        Ok(match self.read(BINDINGS_FILE)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        })
    }

    pub fn bound_role(&self, pubkey: &str) -> Result<Option<Role>, SessionError> {
        Ok(self.bindings()?.get(pubkey).copied())
    }

    /// Record `pubkey → role`, refusing to rebind a key to another role.
    fn bind_role(&self, pubkey: &str, role: Role) -> Result<(), SessionError> {
        let mut bindings = self.bindings()?;
        match bindings.get(pubkey) {
            Some(&bound) if bound != role => {
                return Err(SessionError::RoleBound {
                    bound,
                    requested: role,
                })
            }
            Some(_) => return Ok(()),
            None => {}
        }
        bindings.insert(pubkey.to_string(), role);
        self.write(BINDINGS_FILE, &serde_json::to_vec_pretty(&bindings)?)
    }

    /// Unix seconds of the last "mark all read"; zero when never set.
    pub fn unread_since(&self) -> Result<u64, SessionError> {
        Ok(self
            .read(UNREAD_FILE)?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0))
    }

    pub fn set_unread_since(&self, ts: u64) -> Result<(), SessionError> {
        self.write(UNREAD_FILE, ts.to_string().as_bytes())
    }

    fn read(&self, name: &str) -> Result<Option<String>, SessionError> {
        match fs::read_to_string(self.dir.join(name)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), SessionError> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.persist(self.dir.join(name)).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("session"));
        (dir, store)
    }

    fn teacher(username: &str) -> ProfileInput {
        ProfileInput {
            username: username.into(),
            bio: " maths ".into(),
            role: Role::Teacher,
        }
    }

    #[test]
    fn signup_persists_session() {
        let (_dir, store) = store();
        assert!(matches!(store.load().unwrap(), AuthState::Unauthenticated));
        let setup = AuthState::Unauthenticated.generate_keys().unwrap();
        let state = setup.complete_setup(&store, teacher("ada")).unwrap();
        let session = state.session().unwrap();
        assert_eq!(session.role(), Role::Teacher);
        assert_eq!(session.profile.bio, "maths");

        let restored = store.load().unwrap();
        let restored = restored.session().unwrap();
        assert_eq!(restored.profile, session.profile);
        assert_eq!(restored.keys.public_hex(), session.pubkey());
    }

    #[test]
    fn transitions_out_of_order_are_refused() {
        let (_dir, store) = store();
        assert!(matches!(
            AuthState::Unauthenticated.complete_setup(&store, teacher("x")),
            Err(SessionError::InvalidTransition { .. })
        ));
        let state = AuthState::Unauthenticated
            .generate_keys()
            .unwrap()
            .complete_setup(&store, teacher("x"))
            .unwrap();
        assert!(matches!(
            state.clone().generate_keys(),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            state.login(&store, &"01".repeat(32), None),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn logout_clears_secret_profile_and_watermark() {
        let (_dir, store) = store();
        let state = AuthState::Unauthenticated
            .generate_keys()
            .unwrap()
            .complete_setup(&store, teacher("ada"))
            .unwrap();
        store.set_unread_since(1_700_000_000).unwrap();
        let state = state.logout(&store).unwrap();
        assert!(matches!(state, AuthState::Unauthenticated));
        assert!(matches!(store.load().unwrap(), AuthState::Unauthenticated));
        assert!(store.load_profile().unwrap().is_none());
        assert_eq!(store.unread_since().unwrap(), 0);
    }

    #[test]
    fn login_reuses_binding_and_refuses_role_switch() {
        let (_dir, store) = store();
        let state = AuthState::Unauthenticated
            .generate_keys()
            .unwrap()
            .complete_setup(&store, teacher("ada"))
            .unwrap();
        let secret = state.session().unwrap().keys.secret_hex();
        let pubkey = state.session().unwrap().pubkey().to_string();
        state.logout(&store).unwrap();

        let err = AuthState::Unauthenticated
            .login(&store, &secret, Some(Role::Student))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::RoleBound {
                bound: Role::Teacher,
                requested: Role::Student
            }
        ));

        let state = AuthState::Unauthenticated.login(&store, &secret, None).unwrap();
        let session = state.session().unwrap();
        assert_eq!(session.role(), Role::Teacher);
        assert_eq!(session.pubkey(), pubkey);
        assert_eq!(store.bound_role(&pubkey).unwrap(), Some(Role::Teacher));
    }

    #[test]
    fn login_with_unknown_key_creates_minimal_profile() {
        let (_dir, store) = store();
        let secret = "07".repeat(32);
        let state = AuthState::Unauthenticated.login(&store, &secret, None).unwrap();
        let profile = &state.session().unwrap().profile;
        assert_eq!(profile.role, Role::Student);
        assert!(profile.username.is_empty());
        assert_eq!(
            profile.pubkey,
            Keys::from_secret_hex(&secret).unwrap().public_hex()
        );
    }

    #[test]
    fn login_rejects_garbage_secret() {
        let (_dir, store) = store();
        assert!(matches!(
            AuthState::Unauthenticated.login(&store, "not-hex", None),
            Err(SessionError::Key(_))
        ));
        assert!(matches!(store.load().unwrap(), AuthState::Unauthenticated));
    }

    #[test]
    fn setup_as_other_role_is_refused_for_bound_key() {
        let (_dir, store) = store();
        let keys = Keys::from_secret_hex(&"09".repeat(32)).unwrap();
        AuthState::Unauthenticated
            .login(&store, &keys.secret_hex(), Some(Role::Student))
            .unwrap()
            .logout(&store)
            .unwrap();
        let setup = AuthState::ProfileSetup { keys };
        assert!(matches!(
            setup.complete_setup(&store, teacher("eve")),
            Err(SessionError::RoleBound { .. })
        ));
    }

    #[test]
    fn watermark_roundtrip() {
        let (_dir, store) = store();
        assert_eq!(store.unread_since().unwrap(), 0);
        store.set_unread_since(42).unwrap();
        assert_eq!(store.unread_since().unwrap(), 42);
    }
}
