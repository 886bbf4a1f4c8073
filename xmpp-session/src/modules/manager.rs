// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::any::TypeId;
use core::fmt;
use std::collections::HashSet;

use minidom::Element;

use super::{resolve, Criteria, ModuleDescriptor, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::{ConfigurationError, Error};

struct Slot {
    id: TypeId,
    name: &'static str,
    criteria: Option<Criteria>,
    features: Vec<&'static str>,
    // Empty while the module runs its initialize hook.
    module: Option<Box<dyn XmppModule>>,
}

/// Registry of installed modules, in installation order.
#[derive(Default)]
pub struct ModulesManager {
    slots: Vec<Slot>,
}

impl fmt::Debug for ModulesManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ModulesManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a batch of modules.
    ///
    /// The batch is ordered by [`resolve`]; on a dependency cycle nothing is
    /// installed. Once every module of the batch is registered, their
    /// [`initialize`][`XmppModule::initialize`] hooks run in installation
    /// order.
    pub fn install(
        &mut self,
        descriptors: Vec<ModuleDescriptor>,
        ctx: &mut Context,
    ) -> Result<(), Error> {
        let installed: HashSet<TypeId> = self.slots.iter().map(|slot| slot.id).collect();
        let ordered = resolve(descriptors, &installed)?;

        let first = self.slots.len();
        for descriptor in ordered {
            let id = descriptor.id();
            let name = descriptor.name();
            let module = descriptor.build();
            log::debug!("installing module {}", name);
            self.slots.push(Slot {
                id,
                name,
                criteria: module.criteria(),
                features: module.features(),
                module: Some(module),
            });
        }

        for i in first..self.slots.len() {
            let Some(mut module) = self.slots[i].module.take() else {
                return Err(Error::InvalidState);
            };
            let result = module.initialize(ctx, self);
            self.slots[i].module = Some(module);
            if let Err(e) = result {
                log::error!("initializing module {} failed: {}", self.slots[i].name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Names of the installed modules, in installation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.name).collect()
    }

    /// Whether `M` is installed.
    pub fn contains<M: ModuleProvider>(&self) -> bool {
        self.slots.iter().any(|slot| slot.id == TypeId::of::<M>())
    }

    /// The installed instance of `M`.
    pub fn get<M: ModuleProvider>(&self) -> Option<&M> {
        self.slots
            .iter()
            .find(|slot| slot.id == TypeId::of::<M>())?
            .module
            .as_deref()?
            .as_any()
            .downcast_ref()
    }

    /// The installed instance of `M`, mutably.
    pub fn get_mut<M: ModuleProvider>(&mut self) -> Option<&mut M> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == TypeId::of::<M>())?
            .module
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut()
    }

    /// Like [`get_mut`][`Self::get_mut`], failing if `M` is missing.
    pub fn require_mut<M: ModuleProvider>(&mut self) -> Result<&mut M, ConfigurationError> {
        self.get_mut::<M>().ok_or(ConfigurationError::MissingModule(M::NAME))
    }

    /// Union of the features of all installed modules, deduplicated, in
    /// installation order.
    pub fn available_features(&self) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        self.slots
            .iter()
            .flat_map(|slot| slot.features.iter().copied())
            .filter(|feature| seen.insert(*feature))
            .collect()
    }

    /// Indices of the modules whose criteria select `element`.
    pub(crate) fn modules_for(&self, element: &Element) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.criteria
                    .as_ref()
                    .is_some_and(|criteria| criteria.matches(element))
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn process(
        &mut self,
        index: usize,
        ctx: &mut Context,
        element: &Element,
    ) -> Result<(), Error> {
        let slot = self.slots.get_mut(index).ok_or(Error::InvalidState)?;
        let module = slot.module.as_deref_mut().ok_or(Error::InvalidState)?;
        log::trace!("module {} processing <{}/>", slot.name, element.name());
        module.process(ctx, element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;

    #[derive(Default)]
    struct Base {
        initialized_with: Vec<&'static str>,
    }

    impl XmppModule for Base {
        fn features(&self) -> Vec<&'static str> {
            vec!["urn:example:base", "urn:example:shared"]
        }

        fn initialize(&mut self, _: &mut Context, modules: &ModulesManager) -> Result<(), Error> {
            // Every module of the batch is visible here, including the ones
            // installed after this one.
            self.initialized_with = modules.names();
            Ok(())
        }

        fn process(&mut self, _: &mut Context, _: &Element) -> Result<(), Error> {
            Ok(())
        }
    }

    impl ModuleProvider for Base {
        const NAME: &'static str = "base";
    }

    #[derive(Default)]
    struct Ping;

    impl XmppModule for Ping {
        fn criteria(&self) -> Option<Criteria> {
            Some(Criteria::stanza_with("iq", "urn:xmpp:ping"))
        }

        fn features(&self) -> Vec<&'static str> {
            vec!["urn:xmpp:ping", "urn:example:shared"]
        }

        fn process(&mut self, _: &mut Context, _: &Element) -> Result<(), Error> {
            Ok(())
        }
    }

    impl ModuleProvider for Ping {
        const NAME: &'static str = "ping";

        fn requires() -> Vec<fn() -> ModuleDescriptor> {
            vec![ModuleDescriptor::new::<Base>]
        }
    }

    #[test]
    fn install_resolves_and_initializes() {
        let mut harness = Harness::new();
        let mut modules = ModulesManager::new();
        modules
            .install(vec![ModuleDescriptor::new::<Ping>()], &mut harness.context())
            .unwrap();

        assert_eq!(modules.names(), ["base", "ping"]);
        assert!(modules.contains::<Ping>());
        assert_eq!(modules.get::<Base>().unwrap().initialized_with, ["base", "ping"]);
        assert_eq!(
            modules.available_features(),
            ["urn:example:base", "urn:example:shared", "urn:xmpp:ping"]
        );
    }

    #[test]
    fn routes_by_criteria() {
        let mut harness = Harness::new();
        let mut modules = ModulesManager::new();
        modules
            .install(vec![ModuleDescriptor::new::<Ping>()], &mut harness.context())
            .unwrap();

        let ping: Element = "<iq xmlns='jabber:client' type='get' id='p'><ping xmlns='urn:xmpp:ping'/></iq>"
            .parse()
            .unwrap();
        let other: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        assert_eq!(modules.modules_for(&ping), [1]);
        assert!(modules.modules_for(&other).is_empty());
    }

    #[test]
    fn second_batch_reuses_installed_dependencies() {
        let mut harness = Harness::new();
        let mut modules = ModulesManager::new();
        modules
            .install(vec![ModuleDescriptor::new::<Base>()], &mut harness.context())
            .unwrap();
        modules
            .install(vec![ModuleDescriptor::new::<Ping>()], &mut harness.context())
            .unwrap();
        assert_eq!(modules.names(), ["base", "ping"]);
        assert!(modules.require_mut::<Ping>().is_ok());
    }
}
