// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0077 in-band registration.

use minidom::Element;

use super::stream::StreamFeaturesModule;
use super::{ModuleDescriptor, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::ProtocolError;
use crate::event::{Event, RegistrationEvent};
use crate::ns;
use crate::requests::RequestHandle;

/// The registration form sent by the server, to be filled in by the client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrationForm {
    instructions: Option<String>,
    fields: Vec<(String, Option<String>)>,
    data_form: bool,
    registered: bool,
}

impl RegistrationForm {
    /// Parse the result of a registration form request.
    pub fn from_reply(reply: Element) -> Result<Self, ProtocolError> {
        let query = reply
            .get_child("query", ns::REGISTER)
            .ok_or(ProtocolError::InvalidRegistrationResponse)?;
        let mut form = RegistrationForm::default();

        if let Some(x) = query.get_child("x", ns::DATA_FORMS) {
            form.data_form = true;
            form.instructions = x
                .get_child("instructions", ns::DATA_FORMS)
                .map(Element::text);
            for field in x.children().filter(|c| c.is("field", ns::DATA_FORMS)) {
                let Some(var) = field.attr("var") else {
                    continue;
                };
                let value = field.get_child("value", ns::DATA_FORMS).map(Element::text);
                form.fields.push((var.to_owned(), value));
            }
            return Ok(form);
        }

        for child in query.children().filter(|c| c.has_ns(ns::REGISTER)) {
            match child.name() {
                "instructions" => form.instructions = Some(child.text()),
                "registered" => form.registered = true,
                name => {
                    let text = child.text();
                    let value = if text.is_empty() { None } else { Some(text) };
                    form.fields.push((name.to_owned(), value));
                }
            }
        }
        Ok(form)
    }

    /// Instructions for the user, if any.
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Whether the account already exists.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Names of the requested fields, in the order the server sent them.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Whether the server asked for `name`.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Set the value of `name`, adding the field if the server did not ask
    /// for it.
    pub fn set<S: Into<String>>(&mut self, name: &str, value: S) {
        let value = Some(value.into());
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_owned(), value)),
        }
    }

    /// The `<query/>` submitting this form.
    pub fn to_submission(&self) -> Element {
        let query = Element::builder("query", ns::REGISTER);
        if self.data_form {
            let mut x = Element::builder("x", ns::DATA_FORMS).attr("type", "submit");
            for (var, value) in self.fields.iter() {
                x = x.append(
                    Element::builder("field", ns::DATA_FORMS)
                        .attr("var", var.as_str())
                        .append_all(value.clone().map(|value| {
                            Element::builder("value", ns::DATA_FORMS).append(value)
                        })),
                );
            }
            return query.append(x).build();
        }
        query
            .append_all(self.fields.iter().map(|(name, value)| {
                Element::builder(name.as_str(), ns::REGISTER).append_all(value.clone())
            }))
            .build()
    }
}

/// Creates the account before logging in.
#[derive(Debug, Default)]
pub struct InBandRegistrationModule;

impl InBandRegistrationModule {
    /// Whether the server allows registration on this stream.
    pub fn is_offered(&self, ctx: &Context) -> bool {
        ctx.session
            .stream_feature("register", ns::REGISTER_FEATURE)
            .is_some()
    }

    /// Ask for the registration form. It is published as
    /// [`RegistrationEvent::FormReceived`].
    pub fn request_form(&mut self, ctx: &mut Context) -> RequestHandle {
        let events = ctx.event_sender();
        ctx.request()
            .iq_get(None, Element::builder("query", ns::REGISTER).build())
            .name("registration form")
            .try_map(RegistrationForm::from_reply)
            .response(move |result| {
                events.fire(Event::Registration(match result {
                    Ok(form) => RegistrationEvent::FormReceived(form),
                    Err(error) => RegistrationEvent::Failed(error),
                }));
            })
            .send(ctx)
    }

    /// Submit the filled-in form.
    pub fn submit(&mut self, ctx: &mut Context, form: &RegistrationForm) -> RequestHandle {
        let events = ctx.event_sender();
        ctx.request()
            .iq_set(None, form.to_submission())
            .name("registration")
            .response(move |result| {
                events.fire(Event::Registration(match result {
                    Ok(_) => RegistrationEvent::Completed,
                    Err(error) => RegistrationEvent::Failed(error),
                }));
            })
            .send(ctx)
    }
}

impl XmppModule for InBandRegistrationModule {}

impl ModuleProvider for InBandRegistrationModule {
    const NAME: &'static str = "in-band-registration";

    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        vec![ModuleDescriptor::new::<StreamFeaturesModule>]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{parse, Harness};

    #[test]
    fn legacy_form() {
        let reply = parse(
            "<iq xmlns='jabber:client' type='result' id='reg1'>\
               <query xmlns='jabber:iq:register'>\
                 <instructions>Choose a username and password.</instructions>\
                 <username/><password/><email/>\
               </query>\
             </iq>",
        );
        let mut form = RegistrationForm::from_reply(reply).unwrap();
        assert_eq!(form.instructions(), Some("Choose a username and password."));
        assert_eq!(form.field_names().collect::<Vec<_>>(), ["username", "password", "email"]);
        assert!(!form.is_registered());

        form.set("username", "bill");
        form.set("password", "Calliope");
        assert_eq!(form.get("username"), Some("bill"));
        assert_eq!(form.get("email"), None);
        assert_eq!(
            form.to_submission(),
            parse("<query xmlns='jabber:iq:register'><username>bill</username><password>Calliope</password><email/></query>")
        );
    }

    #[test]
    fn data_form() {
        let reply = parse(
            "<iq xmlns='jabber:client' type='result' id='reg3'>\
               <query xmlns='jabber:iq:register'>\
                 <x xmlns='jabber:x:data' type='form'>\
                   <instructions>Fill out this form.</instructions>\
                   <field type='hidden' var='FORM_TYPE'><value>jabber:iq:register</value></field>\
                   <field type='text-single' var='username'/>\
                 </x>\
               </query>\
             </iq>",
        );
        let mut form = RegistrationForm::from_reply(reply).unwrap();
        assert_eq!(form.get("FORM_TYPE"), Some("jabber:iq:register"));
        form.set("username", "juliet");
        let submission = form.to_submission();
        let x = submission.get_child("x", ns::DATA_FORMS).unwrap();
        assert_eq!(x.attr("type"), Some("submit"));
        assert_eq!(x.children().count(), 2);
    }

    #[test]
    fn form_request_and_submission() {
        let mut harness = Harness::new();
        let mut module = InBandRegistrationModule;
        let handle = module.request_form(&mut harness.context());
        harness.sent();
        let reply = parse(&format!(
            "<iq xmlns='jabber:client' type='result' id='{}'><query xmlns='jabber:iq:register'><username/><password/></query></iq>",
            handle.key().id
        ));
        assert!(harness.requests.find_and_execute(&reply));
        let mut events = harness.events();
        let Some(Event::Registration(RegistrationEvent::FormReceived(mut form))) = events.pop() else {
            panic!("no form received");
        };

        form.set("username", "juliet");
        form.set("password", "secret");
        let handle = module.submit(&mut harness.context(), &form);
        let sent = harness.sent();
        assert_eq!(sent[0].attr("type"), Some("set"));
        assert!(harness.requests.find_and_execute(&parse(&format!(
            "<iq xmlns='jabber:client' type='result' id='{}'/>",
            handle.key().id
        ))));
        assert!(matches!(
            harness.events().as_slice(),
            [Event::Registration(RegistrationEvent::Completed)]
        ));
    }
}
