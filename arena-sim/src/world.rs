use std::collections::BTreeMap;

use arena_shared::{
    PlayerId, Role, ACCEL, DRAG, MAX_SPEED, PLAYER_RADIUS, PLAYER_Y, WORLD_BOUND,
};
use serde::Serialize;

const INPUT_EPSILON: f32 = 1e-4;
const YAW_SPEED_EPSILON: f32 = 0.01;
const SEPARATION_PASSES: usize = 3;
const AGENT_SECTION_RADIUS: f32 = 60.0;
const HUMAN_SPAWN_STEP: f32 = 3.0;

/// Axis-aligned obstacle footprint on the ground plane.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Aabb {
    pub min_x: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_z: f32,
}

impl Aabb {
    pub fn new(min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Self {
        Self {
            min_x,
            min_z,
            max_x,
            max_z,
        }
    }

    fn contains_circle(&self, x: f32, z: f32, r: f32) -> bool {
        x > self.min_x - r && x < self.max_x + r && z > self.min_z - r && z < self.max_z + r
    }

    /// Pushes a circle center out along the axis of least penetration.
    /// Returns the corrected position, or `None` when there is no overlap.
    fn push_out(&self, x: f32, z: f32, r: f32) -> Option<(f32, f32)> {
        if !self.contains_circle(x, z, r) {
            return None;
        }
        let left = x - (self.min_x - r);
        let right = (self.max_x + r) - x;
        let near = z - (self.min_z - r);
        let far = (self.max_z + r) - z;

        let mut best = left;
        let mut out = (self.min_x - r, z);
        if right < best {
            best = right;
            out = (self.max_x + r, z);
        }
        if near < best {
            best = near;
            out = (x, self.min_z - r);
        }
        if far < best {
            out = (x, self.max_z + r);
        }
        Some(out)
    }
}

struct Body {
    x: f32,
    z: f32,
    vx: f32,
    vz: f32,
    yaw: f32,
    role: Role,
}

#[derive(Clone, Copy, Default)]
struct Input {
    x: f32,
    z: f32,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub speed: f32,
    pub role: Role,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimSnapshot {
    pub tick: u64,
    pub players: Vec<PlayerState>,
}

/// The simulated plane. Players are keyed in a `BTreeMap` so every pass
/// iterates in the same order and a step is a pure function of prior state
/// and inputs.
pub struct WorldSim {
    players: BTreeMap<PlayerId, Body>,
    inputs: BTreeMap<PlayerId, Input>,
    obstacles: Vec<Aabb>,
    tick: u64,
    agent_locomotion: bool,
}

impl WorldSim {
    pub fn new(obstacles: Vec<Aabb>, agent_locomotion: bool) -> Self {
        Self {
            players: BTreeMap::new(),
            inputs: BTreeMap::new(),
            obstacles,
            tick: 0,
            agent_locomotion,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn contains(&self, id: &PlayerId) -> bool {
        self.players.contains_key(id)
    }

    pub fn position(&self, id: &PlayerId) -> Option<(f32, f32)> {
        self.players.get(id).map(|b| (b.x, b.z))
    }

    /// Idempotent. A rejoin keeps the existing body untouched.
    pub fn join(
        &mut self,
        id: PlayerId,
        role: Role,
        preferred: Option<(f32, f32)>,
        spawn_section: Option<u8>,
    ) {
        if self.players.contains_key(&id) {
            return;
        }
        let (x, z) = self.spawn_position(role, preferred, spawn_section);
        self.players.insert(
            id.clone(),
            Body {
                x,
                z,
                vx: 0.0,
                vz: 0.0,
                yaw: 0.0,
                role,
            },
        );
        self.inputs.insert(id, Input::default());
    }

    pub fn leave(&mut self, id: &PlayerId) {
        self.players.remove(id);
        self.inputs.remove(id);
    }

    /// Last-write-wins per tick; components clamped to [-1, 1]. Unknown ids
    /// are ignored.
    pub fn set_input(&mut self, id: &PlayerId, move_x: f32, move_z: f32) -> bool {
        let Some(slot) = self.inputs.get_mut(id) else {
            return false;
        };
        slot.x = clamp_component(move_x);
        slot.z = clamp_component(move_z);
        true
    }

    /// Admin override: bounds-checked placement that bypasses motion.
    pub fn teleport(&mut self, id: &PlayerId, x: f32, z: f32) -> bool {
        let Some(body) = self.players.get_mut(id) else {
            return false;
        };
        body.x = x.clamp(-WORLD_BOUND, WORLD_BOUND);
        body.z = z.clamp(-WORLD_BOUND, WORLD_BOUND);
        body.vx = 0.0;
        body.vz = 0.0;
        true
    }

    pub fn step(&mut self, dt: f32) -> SimSnapshot {
        for (id, body) in self.players.iter_mut() {
            let input = if body.role == Role::Agent && !self.agent_locomotion {
                Input::default()
            } else {
                self.inputs.get(id).copied().unwrap_or_default()
            };

            let mag = (input.x * input.x + input.z * input.z).sqrt();
            if mag > INPUT_EPSILON {
                body.vx += input.x / mag * ACCEL * dt;
                body.vz += input.z / mag * ACCEL * dt;
            } else {
                let drag = (DRAG * dt).min(1.0);
                body.vx -= body.vx * drag;
                body.vz -= body.vz * drag;
            }

            let speed = (body.vx * body.vx + body.vz * body.vz).sqrt();
            if speed > MAX_SPEED {
                let scale = MAX_SPEED / speed;
                body.vx *= scale;
                body.vz *= scale;
            }

            body.x += body.vx * dt;
            body.z += body.vz * dt;
            if body.x <= -WORLD_BOUND || body.x >= WORLD_BOUND {
                body.x = body.x.clamp(-WORLD_BOUND, WORLD_BOUND);
                body.vx = 0.0;
            }
            if body.z <= -WORLD_BOUND || body.z >= WORLD_BOUND {
                body.z = body.z.clamp(-WORLD_BOUND, WORLD_BOUND);
                body.vz = 0.0;
            }

            let speed = (body.vx * body.vx + body.vz * body.vz).sqrt();
            if speed > YAW_SPEED_EPSILON {
                body.yaw = body.vx.atan2(body.vz);
            }
        }

        self.resolve_collisions();

        self.tick += 1;
        self.snapshot()
    }

    pub fn snapshot(&self) -> SimSnapshot {
        SimSnapshot {
            tick: self.tick,
            players: self
                .players
                .iter()
                .map(|(id, b)| PlayerState {
                    id: id.clone(),
                    x: b.x,
                    y: PLAYER_Y,
                    z: b.z,
                    yaw: b.yaw,
                    speed: (b.vx * b.vx + b.vz * b.vz).sqrt(),
                    role: b.role,
                })
                .collect(),
        }
    }

    fn resolve_collisions(&mut self) {
        let ids: Vec<PlayerId> = self.players.keys().cloned().collect();
        for _ in 0..SEPARATION_PASSES {
            let mut moved = false;

            for id in &ids {
                let body = self.players.get_mut(id).unwrap();
                for obstacle in &self.obstacles {
                    if let Some((x, z)) = obstacle.push_out(body.x, body.z, PLAYER_RADIUS) {
                        body.x = x.clamp(-WORLD_BOUND, WORLD_BOUND);
                        body.z = z.clamp(-WORLD_BOUND, WORLD_BOUND);
                        moved = true;
                    }
                }
            }

            for i in 0..ids.len() {
                for j in (i + 1)..ids.len() {
                    let a = &self.players[&ids[i]];
                    let b = &self.players[&ids[j]];
                    let dx = b.x - a.x;
                    let dz = b.z - a.z;
                    let dist_sq = dx * dx + dz * dz;
                    let min_dist = 2.0 * PLAYER_RADIUS;
                    if dist_sq >= min_dist * min_dist {
                        continue;
                    }
                    let dist = dist_sq.sqrt();
                    // Coincident centers get a fixed axis so the push stays
                    // deterministic.
                    let (nx, nz) = if dist > INPUT_EPSILON {
                        (dx / dist, dz / dist)
                    } else {
                        (1.0, 0.0)
                    };
                    let push = (min_dist - dist) * 0.5;
                    {
                        let a = self.players.get_mut(&ids[i]).unwrap();
                        a.x = (a.x - nx * push).clamp(-WORLD_BOUND, WORLD_BOUND);
                        a.z = (a.z - nz * push).clamp(-WORLD_BOUND, WORLD_BOUND);
                    }
                    {
                        let b = self.players.get_mut(&ids[j]).unwrap();
                        b.x = (b.x + nx * push).clamp(-WORLD_BOUND, WORLD_BOUND);
                        b.z = (b.z + nz * push).clamp(-WORLD_BOUND, WORLD_BOUND);
                    }
                    moved = true;
                }
            }

            if !moved {
                break;
            }
        }
    }

    fn spawn_position(
        &self,
        role: Role,
        preferred: Option<(f32, f32)>,
        spawn_section: Option<u8>,
    ) -> (f32, f32) {
        if let Some((x, z)) = preferred {
            if x.abs() <= WORLD_BOUND && z.abs() <= WORLD_BOUND {
                return self.free_spot_near(x, z);
            }
        }
        if role == Role::Agent {
            if let Some(section) = spawn_section {
                let (x, z) = section_position(section);
                return self.free_spot_near(x, z);
            }
        }
        // Humans walk a deterministic outward grid until a clear spot shows
        // up; starts just off-center so the origin stays free for stations.
        let mut ring = 1;
        loop {
            for step in 0..(ring * 8) {
                let angle = step as f32 / (ring * 8) as f32 * std::f32::consts::TAU;
                let x = angle.sin() * ring as f32 * HUMAN_SPAWN_STEP;
                let z = angle.cos() * ring as f32 * HUMAN_SPAWN_STEP;
                if self.spot_is_free(x, z) {
                    return (x, z);
                }
            }
            ring += 1;
            if ring as f32 * HUMAN_SPAWN_STEP > WORLD_BOUND {
                return (0.0, 0.0);
            }
        }
    }

    fn free_spot_near(&self, x: f32, z: f32) -> (f32, f32) {
        let mut x = x;
        let mut z = z;
        for obstacle in &self.obstacles {
            if let Some(out) = obstacle.push_out(x, z, PLAYER_RADIUS) {
                x = out.0;
                z = out.1;
            }
        }
        let mut tries = 0;
        while !self.spot_is_free(x, z) && tries < 16 {
            x = (x + 2.5 * PLAYER_RADIUS).clamp(-WORLD_BOUND, WORLD_BOUND);
            tries += 1;
        }
        (x, z)
    }

    fn spot_is_free(&self, x: f32, z: f32) -> bool {
        if x.abs() > WORLD_BOUND || z.abs() > WORLD_BOUND {
            return false;
        }
        if self
            .obstacles
            .iter()
            .any(|o| o.contains_circle(x, z, PLAYER_RADIUS))
        {
            return false;
        }
        self.players.values().all(|b| {
            let dx = b.x - x;
            let dz = b.z - z;
            dx * dx + dz * dz >= (2.0 * PLAYER_RADIUS) * (2.0 * PLAYER_RADIUS)
        })
    }
}

/// Deterministic slot on the 8-section agent spawn ring.
pub fn section_position(section: u8) -> (f32, f32) {
    let angle = (section % 8) as f32 * (std::f32::consts::TAU / 8.0);
    (
        angle.sin() * AGENT_SECTION_RADIUS,
        angle.cos() * AGENT_SECTION_RADIUS,
    )
}

fn clamp_component(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
