// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use sasl::client::MechanismError as SaslMechanismError;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use xmpp_parsers::sasl::DefinedCondition as SaslDefinedCondition;
use xmpp_parsers::stanza_error::StanzaError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error reported by the transport
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Invalid setup, detected before anything is sent
    Configuration(ConfigurationError),
    /// A module refused an incoming stanza; the error is sent back to its
    /// sender
    Stanza(StanzaError),
    /// No transport is attached to the client
    NotConnected,
    /// Should never happen
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Configuration(e) => write!(fmt, "configuration error: {}", e),
            Error::Stanza(e) => write!(fmt, "stanza error: {:?}", e.defined_condition),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::InvalidState => write!(fmt, "invalid state"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Auth(e) => Some(e),
            Error::Configuration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Self {
        Error::Configuration(e)
    }
}

impl From<StanzaError> for Error {
    fn from(e: StanzaError) -> Self {
        Error::Stanza(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(minidom::Error),
    /// Error with expected stanza schema
    Parsers(String),
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// Invalid response to an in-band registration request
    InvalidRegistrationResponse,
    /// A required attribute is missing
    MissingAttribute {
        /// Name of the element lacking the attribute
        element: &'static str,
        /// Name of the missing attribute
        attribute: &'static str,
    },
    /// The peer sent an element which makes no sense at this point
    UnexpectedElement(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Parsers(e) => write!(fmt, "error with expected stanza schema: {}", e),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::InvalidRegistrationResponse => {
                write!(fmt, "invalid response to in-band registration")
            }
            ProtocolError::MissingAttribute { element, attribute } => {
                write!(fmt, "missing attribute {} on <{}/>", attribute, element)
            }
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected element <{}/>", name)
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// Convert an element into one of the typed `xmpp_parsers` payloads.
pub(crate) fn parse<T>(elem: &minidom::Element) -> Result<T, ProtocolError>
where
    T: TryFrom<minidom::Element>,
    T::Error: fmt::Debug,
{
    T::try_from(elem.clone()).map_err(|e| ProtocolError::Parsers(format!("{:?}", e)))
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// Failure from server
    Fail(SaslDefinedCondition),
    /// SASL2 failure from server, carrying the condition element name
    Sasl2Fail(String),
    /// The server sent undecodable SASL data
    Base64(base64::DecodeError),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {:?}", c),
            AuthError::Sasl2Fail(c) => write!(fmt, "failure from the server: {}", c),
            AuthError::Base64(e) => write!(fmt, "invalid base64 from the server: {}", e),
        }
    }
}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

impl From<base64::DecodeError> for AuthError {
    fn from(e: base64::DecodeError) -> Self {
        AuthError::Base64(e)
    }
}

/// Error in the client setup
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// The module dependencies contain a cycle, naming the modules which
    /// could not be ordered
    DependencyCycle(Vec<&'static str>),
    /// A module required by the session controller is not installed
    MissingModule(&'static str),
    /// The JID cannot be used to log in
    MissingCredentials,
}

impl StdError for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigurationError::DependencyCycle(modules) => {
                write!(fmt, "dependency cycle between modules: {}", modules.join(", "))
            }
            ConfigurationError::MissingModule(name) => write!(fmt, "module {} is not installed", name),
            ConfigurationError::MissingCredentials => write!(fmt, "no usable credentials"),
        }
    }
}
