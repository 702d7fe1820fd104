//! Kubernetes components and the order in which they are upgraded.
//!
//! The upgrade order is a correctness property: supervisory components go
//! before workload-facing ones, so a kubelet is never upgraded ahead of the
//! API server it has to register with.

use std::cmp::Ordering;

use crate::crd::MachineRole;

/// A Kubernetes component with its own image and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// kube-apiserver static pod.
    ApiServer,
    /// kube-controller-manager static pod.
    ControllerManager,
    /// kube-scheduler static pod.
    Scheduler,
    /// kubelet service.
    Kubelet,
    /// kube-proxy daemon.
    KubeProxy,
}

impl Component {
    /// All components, in declaration order.
    pub const ALL: [Component; 5] = [
        Component::ApiServer,
        Component::ControllerManager,
        Component::Scheduler,
        Component::Kubelet,
        Component::KubeProxy,
    ];

    /// Canonical component name, matching the pod `app` label.
    pub fn name(&self) -> &'static str {
        match self {
            Component::ApiServer => "kube-apiserver",
            Component::ControllerManager => "kube-controller-manager",
            Component::Scheduler => "kube-scheduler",
            Component::Kubelet => "kubelet",
            Component::KubeProxy => "kube-proxy",
        }
    }

    /// Parse a component from its canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Components hosted by a machine with the given role.
    pub fn for_role(role: MachineRole) -> &'static [Component] {
        match role {
            MachineRole::ControlPlane => &Self::ALL,
            MachineRole::Worker => &[Component::Kubelet, Component::KubeProxy],
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Total order over components used to sequence upgrades.
///
/// Lower rank upgrades first. The order is configurable but always names
/// every component exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPriority {
    order: [Component; 5],
}

impl Default for ComponentPriority {
    fn default() -> Self {
        Self {
            order: [
                Component::ApiServer,
                Component::ControllerManager,
                Component::Scheduler,
                Component::Kubelet,
                Component::KubeProxy,
            ],
        }
    }
}

impl ComponentPriority {
    /// Build a priority table from an explicit order.
    ///
    /// Returns `None` unless every component appears exactly once.
    pub fn new(order: &[Component]) -> Option<Self> {
        if order.len() != Component::ALL.len() {
            return None;
        }
        let mut seen = [false; 5];
        let mut out = Component::ALL;
        for (slot, component) in out.iter_mut().zip(order) {
            let idx = Component::ALL.iter().position(|c| c == component)?;
            if std::mem::replace(seen.get_mut(idx)?, true) {
                return None;
            }
            *slot = *component;
        }
        Some(Self { order: out })
    }

    /// Parse a comma-separated list of component names.
    pub fn parse(list: &str) -> Option<Self> {
        let components = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Component::from_name)
            .collect::<Option<Vec<_>>>()?;
        Self::new(&components)
    }

    /// Rank of a component; lower ranks upgrade first.
    pub fn rank(&self, component: Component) -> usize {
        self.order
            .iter()
            .position(|c| *c == component)
            .unwrap_or(self.order.len())
    }

    /// Strict total order: `a` upgrades before `b`.
    pub fn less(&self, a: Component, b: Component) -> bool {
        self.rank(a) < self.rank(b)
    }

    /// Compare two components by rank.
    pub fn compare(&self, a: Component, b: Component) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }

    /// Components in upgrade order.
    pub fn order(&self) -> &[Component] {
        &self.order
    }
}
