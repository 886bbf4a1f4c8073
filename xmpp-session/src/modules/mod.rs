// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Protocol modules and their registry.
//!
//! A module is plugged into the client through a [`ModuleDescriptor`],
//! which names the module type, the modules it depends on and how to build
//! it. The [`ModulesManager`] orders a batch of descriptors so that every
//! module comes after its dependencies, installs them in that order and
//! only then runs each module's [`XmppModule::initialize`] hook.

use core::any::{Any, TypeId};
use core::fmt;

use minidom::{Element, ElementBuilder};

use crate::context::Context;
use crate::error::Error;

pub mod bind;
mod criteria;
pub mod disco;
mod manager;
pub mod message;
pub mod presence;
pub mod register;
mod resolver;
pub mod roster;
pub mod sasl;
pub mod sasl2;
pub mod stream;

pub use criteria::Criteria;
pub use manager::ModulesManager;
pub use resolver::resolve;

/// Start a reply of `type_` to `stanza`: same element name and id,
/// addressed to its sender.
pub(crate) fn reply_to(stanza: &Element, type_: &str) -> ElementBuilder {
    Element::builder(stanza.name(), crate::ns::JABBER_CLIENT)
        .attr("type", type_)
        .attr("id", stanza.attr("id"))
        .attr("to", stanza.attr("from"))
}

/// Access to a module as [`Any`], for lookup by type.
pub trait AsAny: Any {
    /// Upcast to `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Upcast to `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A protocol module.
pub trait XmppModule: AsAny + Send {
    /// Incoming elements this module wants to see. `None` means none.
    fn criteria(&self) -> Option<Criteria> {
        None
    }

    /// Service discovery features implemented by this module.
    fn features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Called once every module of the installed batch is registered.
    fn initialize(&mut self, _ctx: &mut Context, _modules: &ModulesManager) -> Result<(), Error> {
        Ok(())
    }

    /// Handle an incoming element matching [`criteria`][`Self::criteria`].
    ///
    /// Returning [`Error::Stanza`] for a stanza sends that error back to its
    /// sender.
    fn process(&mut self, _ctx: &mut Context, _element: &Element) -> Result<(), Error> {
        Ok(())
    }
}

/// Static information about a module type.
pub trait ModuleProvider: XmppModule + Sized {
    /// Name used in logs and errors.
    const NAME: &'static str;

    /// Modules which must be installed before this one.
    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        Vec::new()
    }
}

/// A module type, its dependencies and how to build it.
pub struct ModuleDescriptor {
    id: TypeId,
    name: &'static str,
    requires: Vec<fn() -> ModuleDescriptor>,
    factory: Box<dyn FnOnce() -> Box<dyn XmppModule> + Send>,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("requires", &self.requires.len())
            .finish()
    }
}

impl ModuleDescriptor {
    /// Describe `M` with its default configuration.
    pub fn new<M: ModuleProvider + Default>() -> Self {
        Self::with_factory(M::default)
    }

    /// Describe `M`, built by `factory` when it is installed.
    pub fn with_factory<M, F>(factory: F) -> Self
    where
        M: ModuleProvider,
        F: FnOnce() -> M + Send + 'static,
    {
        Self {
            id: TypeId::of::<M>(),
            name: M::NAME,
            requires: M::requires(),
            factory: Box::new(move || Box::new(factory())),
        }
    }

    /// Describe an already configured module.
    pub fn from_instance<M: ModuleProvider>(module: M) -> Self {
        Self::with_factory(move || module)
    }

    /// Type identifier of the module.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Name of the module.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Default descriptors of the modules this one depends on.
    pub(crate) fn requirements(&self) -> impl Iterator<Item = ModuleDescriptor> + '_ {
        self.requires.iter().map(|make| make())
    }

    pub(crate) fn build(self) -> Box<dyn XmppModule> {
        (self.factory)()
    }
}
