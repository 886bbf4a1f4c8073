// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use minidom::Element;

/// Predicate selecting the incoming elements a module handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criteria {
    /// Element name matches.
    Name(String),
    /// Element namespace matches.
    Xmlns(String),
    /// Both name and namespace match.
    NameAndXmlns(String, String),
    /// Any of the criteria match.
    Or(Vec<Criteria>),
    /// All of the criteria match.
    And(Vec<Criteria>),
    /// The criterion does not match.
    Not(Box<Criteria>),
    /// The first criterion matches the element, the second one some child
    /// of it, and so on.
    Chain(Vec<Criteria>),
}

impl Criteria {
    /// Match on the element name.
    pub fn name<S: Into<String>>(name: S) -> Self {
        Criteria::Name(name.into())
    }

    /// Match on the element namespace.
    pub fn xmlns<S: Into<String>>(ns: S) -> Self {
        Criteria::Xmlns(ns.into())
    }

    /// Match on element name and namespace.
    pub fn name_and_xmlns<S: Into<String>, N: Into<String>>(name: S, ns: N) -> Self {
        Criteria::NameAndXmlns(name.into(), ns.into())
    }

    /// Match if any of `criteria` matches.
    pub fn or(criteria: Vec<Criteria>) -> Self {
        Criteria::Or(criteria)
    }

    /// Match if all of `criteria` match.
    pub fn and(criteria: Vec<Criteria>) -> Self {
        Criteria::And(criteria)
    }

    /// Match if `criteria` does not.
    #[allow(clippy::should_implement_trait)]
    pub fn not(criteria: Criteria) -> Self {
        Criteria::Not(Box::new(criteria))
    }

    /// Match a path of nested elements, outermost first.
    pub fn chain(criteria: Vec<Criteria>) -> Self {
        Criteria::Chain(criteria)
    }

    /// Stanza of kind `name` (`iq`, `message` or `presence`) carrying a
    /// child in namespace `ns`.
    pub fn stanza_with<S: Into<String>, N: Into<String>>(name: S, ns: N) -> Self {
        Criteria::chain(vec![
            Criteria::name_and_xmlns(name, crate::ns::JABBER_CLIENT),
            Criteria::xmlns(ns),
        ])
    }

    /// Whether `element` is selected.
    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Criteria::Name(name) => element.name() == name,
            Criteria::Xmlns(ns) => element.ns() == *ns,
            Criteria::NameAndXmlns(name, ns) => element.is(name.as_str(), ns.as_str()),
            Criteria::Or(criteria) => criteria.iter().any(|c| c.matches(element)),
            Criteria::And(criteria) => criteria.iter().all(|c| c.matches(element)),
            Criteria::Not(criteria) => !criteria.matches(element),
            Criteria::Chain(criteria) => match_chain(criteria, element),
        }
    }
}

fn match_chain(criteria: &[Criteria], element: &Element) -> bool {
    match criteria.split_first() {
        None => true,
        Some((first, rest)) => {
            first.matches(element)
                && (rest.is_empty() || element.children().any(|child| match_chain(rest, child)))
        }
    }
}
