//! Session token holder shared by the backends that log in.
//!
//! Refresh is single-flight: the first caller to see an expired token logs
//! in while holding the lock, anyone else who saw the same token waits and
//! reuses the fresh one.

use std::future::Future;

use log::{debug, info};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;

use crate::error::ClientError;

/// A token together with the generation it was issued in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct State {
    token: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<State>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token, logging in first if there is none yet.
    pub async fn token<F, Fut>(&self, login: F) -> Result<Token, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ClientError>>,
    {
        let mut state = self.state.lock().await;
        if let Some(value) = &state.token {
            return Ok(Token {
                value: value.clone(),
                generation: state.generation,
            });
        }
        Ok(Self::store(&mut state, login().await?))
    }

    /// Replaces the token observed as `stale`.  If another caller already
    /// replaced it, that token is returned without logging in again.
    pub async fn refresh<F, Fut>(&self, stale: &Token, login: F) -> Result<Token, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ClientError>>,
    {
        let mut state = self.state.lock().await;
        if state.generation != stale.generation {
            if let Some(value) = &state.token {
                debug!("Session already refreshed by a concurrent caller");
                return Ok(Token {
                    value: value.clone(),
                    generation: state.generation,
                });
            }
        }
        state.token = None;
        Ok(Self::store(&mut state, login().await?))
    }

    /// Sends the request built by `build` with the current token.  On a 401
    /// the session is refreshed and the request is sent exactly once more.
    pub async fn send<L, LFut, B>(
        &self,
        backend: &str,
        login: L,
        build: B,
    ) -> Result<Response, ClientError>
    where
        L: Fn() -> LFut,
        LFut: Future<Output = Result<String, ClientError>>,
        B: Fn(&str) -> RequestBuilder,
    {
        let token = self.token(&login).await?;
        let resp = build(&token.value).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        info!("{} session expired, logging in again", backend);
        let token = self.refresh(&token, &login).await?;
        let resp = build(&token.value).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        Ok(resp)
    }

    fn store(state: &mut State, value: String) -> Token {
        state.generation += 1;
        state.token = Some(value.clone());
        Token {
            value,
            generation: state.generation,
        }
    }
}
