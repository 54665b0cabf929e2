//! Worker registry: admits exactly `num_pairs` senders and
//! `num_pairs * receivers_per_sender` receivers, assigns their pair and slot
//! by arrival order within each role, then derives the pair assignments.

use crate::cli::Role;
use crate::config::{NetworkSettings, WorkerSettings};
use crate::error::RegistrationError;
use crate::protocol::{DataLayout, PairAssignment, Registration, WorkerIdentity};
use std::collections::HashMap;

#[derive(Debug)]
pub struct WorkerRegistry {
    num_pairs: usize,
    receivers_per_sender: usize,
    /// Arrival order
    workers: Vec<WorkerIdentity>,
    by_id: HashMap<String, usize>,
    senders: usize,
    receivers: usize,
    closed: bool,
}

impl WorkerRegistry {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            num_pairs: settings.num_pairs,
            receivers_per_sender: settings.receivers_per_sender,
            workers: Vec::with_capacity(settings.expected_workers()),
            by_id: HashMap::new(),
            senders: 0,
            receivers: 0,
            closed: false,
        }
    }

    pub fn target(&self) -> usize {
        self.num_pairs * (1 + self.receivers_per_sender)
    }

    /// Admit a worker. Re-sending an identical registration before the
    /// registry closes returns the identity already issued.
    pub fn register(
        &mut self,
        registration: &Registration,
    ) -> Result<WorkerIdentity, RegistrationError> {
        if self.closed {
            return Err(RegistrationError::RegistrationClosed);
        }

        if let Some(&position) = self.by_id.get(&registration.worker_id) {
            let existing = &self.workers[position];
            if existing.role == registration.role && existing.address == registration.address {
                return Ok(existing.clone());
            }
            return Err(RegistrationError::DuplicateRegistration(
                registration.worker_id.clone(),
            ));
        }

        let (pair_index, slot) = match registration.role {
            Role::Sender => {
                if self.senders >= self.num_pairs {
                    return Err(RegistrationError::RoleFull {
                        role: Role::Sender.to_string(),
                        capacity: self.num_pairs,
                    });
                }
                self.senders += 1;
                (self.senders - 1, 0)
            }
            Role::Receiver => {
                let capacity = self.num_pairs * self.receivers_per_sender;
                if self.receivers >= capacity {
                    return Err(RegistrationError::RoleFull {
                        role: Role::Receiver.to_string(),
                        capacity,
                    });
                }
                let arrival = self.receivers;
                self.receivers += 1;
                (
                    arrival / self.receivers_per_sender,
                    arrival % self.receivers_per_sender,
                )
            }
        };

        let identity = WorkerIdentity {
            id: registration.worker_id.clone(),
            role: registration.role,
            pair_index,
            slot,
            address: registration.address,
        };
        self.by_id
            .insert(identity.id.clone(), self.workers.len());
        self.workers.push(identity.clone());
        Ok(identity)
    }

    pub fn is_full(&self) -> bool {
        self.workers.len() == self.target()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Refuse every further registration
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Registered workers in arrival order
    pub fn snapshot(&self) -> Vec<WorkerIdentity> {
        self.workers.clone()
    }

    /// Pair assignments with their data ports. `None` until the registry is full.
    ///
    /// When receivers bind, receiver `k` of pair `p` listens on
    /// `data_port_start + p * receivers_per_sender + k`; when senders bind,
    /// sender `p` listens on `data_port_start + p`. Validated settings keep
    /// every port inside the u16 range.
    pub fn assignments(&self, network: &NetworkSettings) -> Option<Vec<PairAssignment>> {
        if !self.is_full() {
            return None;
        }

        let mut pairs = Vec::with_capacity(self.num_pairs);
        for pair_id in 0..self.num_pairs {
            let sender = self
                .workers
                .iter()
                .find(|w| w.role == Role::Sender && w.pair_index == pair_id)?
                .clone();
            let mut receivers: Vec<WorkerIdentity> = self
                .workers
                .iter()
                .filter(|w| w.role == Role::Receiver && w.pair_index == pair_id)
                .cloned()
                .collect();
            receivers.sort_by_key(|w| w.slot);

            let base = network.data_port_start as usize;
            let layout = if network.sender_bind {
                DataLayout::SenderBinds {
                    port: (base + pair_id) as u16,
                }
            } else {
                DataLayout::ReceiversBind {
                    ports: (0..self.receivers_per_sender)
                        .map(|slot| (base + pair_id * self.receivers_per_sender + slot) as u16)
                        .collect(),
                }
            };

            pairs.push(PairAssignment {
                pair_id,
                sender,
                receivers,
                layout,
            });
        }
        Some(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn registration(id: &str, role: Role) -> Registration {
        Registration {
            worker_id: id.to_string(),
            role,
            address: "127.0.0.1".parse().unwrap(),
        }
    }

    fn registry(num_pairs: usize, receivers_per_sender: usize) -> WorkerRegistry {
        WorkerRegistry::new(&WorkerSettings {
            num_pairs,
            receivers_per_sender,
        })
    }

    #[test]
    fn test_fills_at_target_and_rejects_overflow() {
        let mut registry = registry(1, 1);
        assert_eq!(registry.target(), 2);

        registry.register(&registration("s0", Role::Sender)).unwrap();
        assert!(!registry.is_full());
        registry
            .register(&registration("r0", Role::Receiver))
            .unwrap();
        assert!(registry.is_full());

        let err = registry
            .register(&registration("r1", Role::Receiver))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::RoleFull { .. }));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_arrival_order_assigns_pairs_and_slots() {
        let mut registry = registry(2, 2);
        let r0 = registry.register(&registration("r0", Role::Receiver)).unwrap();
        let s0 = registry.register(&registration("s0", Role::Sender)).unwrap();
        let r1 = registry.register(&registration("r1", Role::Receiver)).unwrap();
        let r2 = registry.register(&registration("r2", Role::Receiver)).unwrap();
        let s1 = registry.register(&registration("s1", Role::Sender)).unwrap();

        assert_eq!((r0.pair_index, r0.slot), (0, 0));
        assert_eq!((r1.pair_index, r1.slot), (0, 1));
        assert_eq!((r2.pair_index, r2.slot), (1, 0));
        assert_eq!(s0.pair_index, 0);
        assert_eq!(s1.pair_index, 1);

        let order: Vec<_> = registry.snapshot().into_iter().map(|w| w.id).collect();
        assert_eq!(order, vec!["r0", "s0", "r1", "r2", "s1"]);
    }

    #[test]
    fn test_identical_reregistration_is_idempotent() {
        let mut registry = registry(1, 1);
        let first = registry.register(&registration("s0", Role::Sender)).unwrap();
        let again = registry.register(&registration("s0", Role::Sender)).unwrap();
        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);

        let err = registry
            .register(&registration("s0", Role::Receiver))
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateRegistration("s0".to_string()));
    }

    #[test]
    fn test_closed_registry_rejects_newcomers() {
        let mut registry = registry(2, 1);
        registry.register(&registration("s0", Role::Sender)).unwrap();
        registry.close();
        let err = registry
            .register(&registration("s1", Role::Sender))
            .unwrap_err();
        assert_eq!(err, RegistrationError::RegistrationClosed);
    }

    #[test]
    fn test_assignments_use_disjoint_ports() {
        let mut registry = registry(2, 2);
        for id in ["s0", "s1"] {
            registry.register(&registration(id, Role::Sender)).unwrap();
        }
        assert!(registry.assignments(&NetworkSettings::default()).is_none());
        for id in ["r0", "r1", "r2", "r3"] {
            registry.register(&registration(id, Role::Receiver)).unwrap();
        }

        let network = NetworkSettings::default();
        let pairs = registry.assignments(&network).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].sender.id, "s1");
        assert_eq!(pairs[1].receivers[0].id, "r2");
        assert_eq!(pairs[0].ports(), vec![6000, 6001]);
        assert_eq!(pairs[1].ports(), vec![6002, 6003]);

        let all: HashSet<u16> = pairs.iter().flat_map(|p| p.ports()).collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_one_receiver_per_sender_uses_base_plus_pair() {
        let mut registry = registry(3, 1);
        for i in 0..3 {
            registry
                .register(&registration(&format!("s{}", i), Role::Sender))
                .unwrap();
            registry
                .register(&registration(&format!("r{}", i), Role::Receiver))
                .unwrap();
        }
        let pairs = registry.assignments(&NetworkSettings::default()).unwrap();
        for pair in &pairs {
            assert_eq!(pair.ports(), vec![6000 + pair.pair_id as u16]);
        }
    }

    #[test]
    fn test_sender_bind_layout() {
        let mut registry = registry(2, 3);
        for i in 0..2 {
            registry
                .register(&registration(&format!("s{}", i), Role::Sender))
                .unwrap();
        }
        for i in 0..6 {
            registry
                .register(&registration(&format!("r{}", i), Role::Receiver))
                .unwrap();
        }
        let network = NetworkSettings {
            sender_bind: true,
            ..NetworkSettings::default()
        };
        let pairs = registry.assignments(&network).unwrap();
        assert_eq!(pairs[0].layout, DataLayout::SenderBinds { port: 6000 });
        assert_eq!(pairs[1].layout, DataLayout::SenderBinds { port: 6001 });
        assert_eq!(pairs[1].receivers.len(), 3);
    }
}
