use std::collections::HashSet;

use arena_shared::PlayerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProximityKind {
    Enter,
    Exit,
}

/// One pair transition. The gateway fans each delta out to both
/// participants (or to the surviving one after a purge).
#[derive(Clone, Debug, PartialEq)]
pub struct ProximityDelta {
    pub kind: ProximityKind,
    pub a: PlayerId,
    pub b: PlayerId,
    pub distance: f32,
}

/// Tracks which unordered pairs are currently within the threshold.
/// Distance exactly at the threshold counts as inside.
pub struct ProximityTracker {
    threshold: f32,
    active: HashSet<(PlayerId, PlayerId)>,
}

impl ProximityTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            active: HashSet::new(),
        }
    }

    /// Diffs the merged position list against the prior active set and
    /// replaces it atomically. Deltas are sorted by pair key so downstream
    /// processing is deterministic.
    pub fn observe(&mut self, positions: &[(PlayerId, f32, f32)]) -> Vec<ProximityDelta> {
        let mut current: HashSet<(PlayerId, PlayerId)> = HashSet::new();
        let mut distances = Vec::new();
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let (ref ia, ax, az) = positions[i];
                let (ref ib, bx, bz) = positions[j];
                if ia == ib {
                    continue;
                }
                let dx = ax - bx;
                let dz = az - bz;
                let distance = (dx * dx + dz * dz).sqrt();
                if distance <= self.threshold {
                    let key = pair_key(ia.clone(), ib.clone());
                    if current.insert(key.clone()) {
                        distances.push((key, distance));
                    }
                }
            }
        }

        let mut deltas = Vec::new();
        for (key, distance) in &distances {
            if !self.active.contains(key) {
                deltas.push(ProximityDelta {
                    kind: ProximityKind::Enter,
                    a: key.0.clone(),
                    b: key.1.clone(),
                    distance: *distance,
                });
            }
        }
        for key in &self.active {
            if !current.contains(key) {
                deltas.push(ProximityDelta {
                    kind: ProximityKind::Exit,
                    a: key.0.clone(),
                    b: key.1.clone(),
                    distance: 0.0,
                });
            }
        }
        self.active = current;

        deltas.sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));
        deltas
    }

    /// Drops every pair containing `id` without emitting toward it; the
    /// removed pairs are returned so the caller can notify the survivors.
    pub fn purge(&mut self, id: &PlayerId) -> Vec<(PlayerId, PlayerId)> {
        let removed: Vec<_> = self
            .active
            .iter()
            .filter(|(a, b)| a == id || b == id)
            .cloned()
            .collect();
        for key in &removed {
            self.active.remove(key);
        }
        removed
    }

    pub fn is_near(&self, a: &PlayerId, b: &PlayerId) -> bool {
        self.active.contains(&pair_key(a.clone(), b.clone()))
    }
}

fn pair_key(a: PlayerId, b: PlayerId) -> (PlayerId, PlayerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
