// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used by the session engine.

/// RFC 6120: client stanzas
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: stream wrapper, `<stream:features/>` and `<stream:error/>`
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: stanza error conditions
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// RFC 6120: SASL negotiation
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// XEP-0198: Stream Management
pub const SM: &str = "urn:xmpp:sm:3";

/// XEP-0388: Extensible SASL Profile
pub const SASL2: &str = "urn:xmpp:sasl:2";

/// XEP-0386: Bind 2
pub const BIND2: &str = "urn:xmpp:bind:0";

/// XEP-0077: In-Band Registration
pub const REGISTER: &str = "jabber:iq:register";

/// XEP-0077: registration stream feature
pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";

/// XEP-0004: Data Forms
pub const DATA_FORMS: &str = "jabber:x:data";

/// XEP-0030: Service Discovery
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// RFC 6121: roster management
pub const ROSTER: &str = "jabber:iq:roster";
