// Copyright (c) 2023 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;

use jid::Jid;

use crate::event::make_id;
use crate::modules::register::RegistrationForm;
use crate::requests::DEFAULT_TIMEOUT;

type FormHandler = Arc<dyn Fn(&mut RegistrationForm) + Send + Sync>;

/// Settings for XEP-0077 in-band registration.
///
/// Registration is only attempted when the client was configured with one
/// of these and the server advertises the feature.
#[derive(Clone, Default)]
pub struct RegistrationConfig {
    handlers: Vec<FormHandler>,
}

impl fmt::Debug for RegistrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegistrationConfig")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl RegistrationConfig {
    /// Create a registration config without form handlers.
    ///
    /// The username and password of the client are always filled in.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler which fills in the registration form. Handlers run in
    /// the order they were added.
    pub fn with_form_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut RegistrationForm) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub(crate) fn fill(&self, form: &mut RegistrationForm) {
        for handler in self.handlers.iter() {
            handler(form);
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Account to log into. A resource, if present, is requested when binding.
    pub jid: Jid,
    /// Password, or `None` for anonymous login.
    pub password: Option<String>,
    /// Default time to wait for replies.
    pub request_timeout: Duration,
    /// Interval of the periodic tick driving acks and timeouts.
    pub tick_interval: Duration,
    /// Whether to negotiate XEP-0198 stream management.
    pub stream_management: bool,
    /// Resumption window to ask the server for, in seconds.
    pub sm_max: Option<u32>,
    /// In-band registration, if the account should be created.
    pub registration: Option<RegistrationConfig>,
    /// Stable identifier of this client installation, sent with SASL2.
    pub user_agent_id: String,
    /// Software name sent with SASL2.
    pub software: String,
    /// Device name sent with SASL2.
    pub device: Option<String>,
}

impl Config {
    /// Create a configuration with default settings.
    pub fn new<P: Into<String>>(jid: Jid, password: P) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::anonymous(jid)
        }
    }

    /// Create a configuration for anonymous login on the domain of `jid`.
    pub fn anonymous(jid: Jid) -> Self {
        Self {
            jid,
            password: None,
            request_timeout: DEFAULT_TIMEOUT,
            tick_interval: Duration::from_secs(2),
            stream_management: true,
            sm_max: None,
            registration: None,
            user_agent_id: make_id(),
            software: String::from("xmpp-session"),
            device: None,
        }
    }

    /// Sets the default time to wait for replies.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the interval of the periodic tick.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Do not negotiate stream management.
    pub fn without_stream_management(mut self) -> Self {
        self.stream_management = false;
        self
    }

    /// Sets the preferred resumption window in seconds.
    pub fn with_sm_max(mut self, max: u32) -> Self {
        self.sm_max = Some(max);
        self
    }

    /// Register the account before logging in.
    pub fn with_registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = Some(registration);
        self
    }

    /// Sets the SASL2 user agent.
    pub fn with_user_agent<S: Into<String>>(
        mut self,
        id: S,
        software: S,
        device: Option<S>,
    ) -> Self {
        self.user_agent_id = id.into();
        self.software = software.into();
        self.device = device.map(Into::into);
        self
    }
}
