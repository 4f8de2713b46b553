use arena_shared::DEFAULT_STATION_PROXIMITY;
use serde::Serialize;

use crate::world::Aabb;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationKind {
    DealerCoinflip,
    DealerRps,
    DealerDiceDuel,
    CashierBank,
    WorldInteractable,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub kind: StationKind,
    pub x: f32,
    pub z: f32,
    pub radius: f32,
    pub actions: Vec<&'static str>,
}

impl Station {
    pub fn contains(&self, x: f32, z: f32) -> bool {
        let dx = x - self.x;
        let dz = z - self.z;
        dx * dx + dz * dz <= self.radius * self.radius
    }
}

/// The fixed in-world layout: three dealer tables around the plaza, the
/// bank, and a decorative fountain players can inspect.
pub fn default_stations() -> Vec<Station> {
    vec![
        Station {
            id: "dealer_coinflip_1".to_owned(),
            kind: StationKind::DealerCoinflip,
            x: 20.0,
            z: 20.0,
            radius: DEFAULT_STATION_PROXIMITY,
            actions: vec!["start", "pick"],
        },
        Station {
            id: "dealer_rps_1".to_owned(),
            kind: StationKind::DealerRps,
            x: -20.0,
            z: 20.0,
            radius: DEFAULT_STATION_PROXIMITY,
            actions: vec!["start", "pick"],
        },
        Station {
            id: "dealer_dice_1".to_owned(),
            kind: StationKind::DealerDiceDuel,
            x: 20.0,
            z: -20.0,
            radius: DEFAULT_STATION_PROXIMITY,
            actions: vec!["start", "pick"],
        },
        Station {
            id: "cashier_bank_1".to_owned(),
            kind: StationKind::CashierBank,
            x: -20.0,
            z: -20.0,
            radius: DEFAULT_STATION_PROXIMITY,
            actions: vec!["balance"],
        },
        Station {
            id: "fountain".to_owned(),
            kind: StationKind::WorldInteractable,
            x: 0.0,
            z: 0.0,
            radius: DEFAULT_STATION_PROXIMITY,
            actions: vec!["inspect"],
        },
    ]
}

/// Static blockers matching the visual set pieces: the bank building behind
/// the cashier and the fountain basin at the plaza center.
pub fn default_obstacles() -> Vec<Aabb> {
    vec![
        Aabb::new(-30.0, -32.0, -22.0, -24.0),
        Aabb::new(-1.5, -1.5, 1.5, 1.5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_radius_check() {
        let stations = default_stations();
        let dealer = stations.iter().find(|s| s.id == "dealer_coinflip_1").unwrap();
        assert!(dealer.contains(20.0, 20.0));
        assert!(dealer.contains(20.0 + dealer.radius, 20.0));
        assert!(!dealer.contains(20.0 + dealer.radius + 0.1, 20.0));
    }

    #[test]
    fn ids_are_unique() {
        let stations = default_stations();
        let mut ids: Vec<_> = stations.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), stations.len());
    }
}
