// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::any::TypeId;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::ModuleDescriptor;
use crate::error::ConfigurationError;

/// Order `descriptors` so that each module comes after the modules it
/// requires.
///
/// Requirements which are neither in `descriptors` nor in `installed` are
/// added with their default configuration, after the explicitly given
/// modules and in the order they were discovered. Among modules whose
/// requirements are satisfied, the one registered first goes first.
///
/// A dependency cycle fails the whole batch.
pub fn resolve(
    descriptors: Vec<ModuleDescriptor>,
    installed: &HashSet<TypeId>,
) -> Result<Vec<ModuleDescriptor>, ConfigurationError> {
    let mut nodes: Vec<ModuleDescriptor> = Vec::with_capacity(descriptors.len());
    let mut index: HashMap<TypeId, usize> = HashMap::new();

    for descriptor in descriptors {
        if installed.contains(&descriptor.id()) {
            log::debug!("module {} is already installed, skipping", descriptor.name());
            continue;
        }
        match index.get(&descriptor.id()) {
            Some(&i) => {
                log::warn!("module {} registered twice, using the last one", descriptor.name());
                nodes[i] = descriptor;
            }
            None => {
                index.insert(descriptor.id(), nodes.len());
                nodes.push(descriptor);
            }
        }
    }

    // Pull in missing requirements transitively.
    let mut i = 0;
    while i < nodes.len() {
        let missing: Vec<ModuleDescriptor> = nodes[i]
            .requirements()
            .filter(|req| !installed.contains(&req.id()) && !index.contains_key(&req.id()))
            .collect();
        for req in missing {
            if index.contains_key(&req.id()) {
                continue;
            }
            log::debug!("adding module {} required by {}", req.name(), nodes[i].name());
            index.insert(req.id(), nodes.len());
            nodes.push(req);
        }
        i += 1;
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (node, descriptor) in nodes.iter().enumerate() {
        let mut seen = HashSet::new();
        for req in descriptor.requirements() {
            let Some(&dep) = index.get(&req.id()) else {
                // Already installed.
                continue;
            };
            if seen.insert(dep) {
                in_degree[node] += 1;
                dependents[dep].push(node);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&n| in_degree[n] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in dependents[node].iter() {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck: Vec<&'static str> = nodes
            .iter()
            .enumerate()
            .filter(|(n, _)| in_degree[*n] > 0)
            .map(|(_, descriptor)| descriptor.name())
            .collect();
        log::error!("module dependency cycle between {}", stuck.join(", "));
        return Err(ConfigurationError::DependencyCycle(stuck));
    }

    let mut slots: Vec<Option<ModuleDescriptor>> = nodes.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|n| slots[n].take()).collect())
}
