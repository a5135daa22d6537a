use crate::{
    project::{Plate, PlateFilament},
    status::bambu_status::{normalize_color, AmsSlot, AmsStatus, AMS_SLOTS},
};

/// Where a plate filament will be fed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilamentSource {
    Tray { ams_id: i64, tray_id: usize },
    ExternalSpool,
}

impl FilamentSource {
    /// Index used in the `ams_mapping` array of a print command
    pub fn global_index(&self) -> Option<i64> {
        match self {
            FilamentSource::Tray { ams_id, tray_id } => {
                Some(ams_id * AMS_SLOTS as i64 + *tray_id as i64)
            }
            FilamentSource::ExternalSpool => None,
        }
    }

    fn label(&self) -> String {
        match self {
            FilamentSource::Tray { ams_id, tray_id } => {
                format!("{}{}", (b'A' + (*ams_id as u8 % 26)) as char, tray_id + 1)
            }
            FilamentSource::ExternalSpool => "Ext".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilamentAssignment {
    pub filament: PlateFilament,
    pub source: Option<FilamentSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilamentMapping {
    pub use_ams: bool,
    pub assignments: Vec<FilamentAssignment>,
}

impl FilamentMapping {
    pub fn is_complete(&self) -> bool {
        self.assignments.iter().all(|a| a.source.is_some())
    }

    pub fn unmapped(&self) -> impl Iterator<Item = &PlateFilament> {
        self.assignments
            .iter()
            .filter(|a| a.source.is_none())
            .map(|a| &a.filament)
    }

    /// One entry per project filament slot, `-1` for slots the plate does not
    /// use. Empty when printing from the external spool.
    pub fn ams_mapping(&self) -> Vec<i64> {
        if !self.use_ams {
            return vec![];
        }
        let len = self
            .assignments
            .iter()
            .map(|a| a.filament.id as usize)
            .max()
            .unwrap_or(0);
        let mut out = vec![-1; len];
        for a in &self.assignments {
            if let (Some(idx), Some(slot)) = (
                a.source.and_then(|s| s.global_index()),
                (a.filament.id as usize).checked_sub(1),
            ) {
                out[slot] = idx;
            }
        }
        out
    }

    pub fn status_text(&self) -> String {
        if !self.is_complete() {
            let missing: Vec<String> = self
                .unmapped()
                .map(|f| format!("{} #{}", f.filament_type, f.color))
                .collect();
            return format!("Unmapped: {}", missing.join(", "));
        }
        self.assignments
            .iter()
            .filter_map(|a| {
                a.source
                    .map(|s| format!("{} #{} > {}", a.filament.filament_type, a.filament.color, s.label()))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Matches every filament of `plate` against the printer's loaded trays.
///
/// A tray must carry the same material type (case-insensitive). Among those,
/// one with the same colour wins, otherwise the first in unit/tray order. A
/// tray feeds at most one filament. Printers without an AMS can run a single
/// filament plate from the external spool.
pub fn map_filaments(
    plate: &Plate,
    ams: Option<&AmsStatus>,
    external_spool: Option<&AmsSlot>,
) -> FilamentMapping {
    let has_ams = ams.is_some_and(|a| !a.units.is_empty());

    if !has_ams {
        let source = match (plate.filaments.as_slice(), external_spool) {
            ([f], Some(spool)) if spool.material.eq_ignore_ascii_case(&f.filament_type) => {
                Some(FilamentSource::ExternalSpool)
            }
            ([_], None) => Some(FilamentSource::ExternalSpool),
            _ => None,
        };
        return FilamentMapping {
            use_ams: false,
            assignments: plate
                .filaments
                .iter()
                .map(|f| FilamentAssignment {
                    filament: f.clone(),
                    source,
                })
                .collect(),
        };
    }

    let slots: Vec<(i64, usize, &AmsSlot)> = ams
        .map(|a| a.loaded_slots().collect())
        .unwrap_or_default();
    let mut used = vec![false; slots.len()];

    let assignments = plate
        .filaments
        .iter()
        .map(|f| {
            let color = normalize_color(&f.color);
            let candidates = || {
                slots.iter().enumerate().filter(|(i, (_, _, slot))| {
                    !used[*i] && slot.material.eq_ignore_ascii_case(&f.filament_type)
                })
            };
            let found = candidates()
                .find(|(_, (_, _, slot))| slot.color == color)
                .or_else(|| candidates().next())
                .map(|(i, (ams_id, tray_id, _))| (i, *ams_id, *tray_id));

            let source = found.map(|(i, ams_id, tray_id)| {
                used[i] = true;
                FilamentSource::Tray { ams_id, tray_id }
            });
            FilamentAssignment {
                filament: f.clone(),
                source,
            }
        })
        .collect();

    FilamentMapping {
        use_ams: true,
        assignments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::bambu_status::AmsUnit;

    fn plate(filaments: &[(u32, &str, &str)]) -> Plate {
        Plate {
            index: 1,
            name: "Plate 1".to_string(),
            prediction: 0,
            weight: 0.0,
            filaments: filaments
                .iter()
                .map(|(id, t, c)| PlateFilament {
                    id: *id,
                    filament_type: t.to_string(),
                    color: c.to_string(),
                    used_m: 1.0,
                    used_g: 1.0,
                })
                .collect(),
            thumbnail: Plate::thumbnail_path_for(1),
        }
    }

    fn ams(units: &[(i64, &[Option<(&str, &str)>])]) -> AmsStatus {
        let mut out = AmsStatus::default();
        for (id, trays) in units {
            let mut unit = AmsUnit {
                id: *id,
                ..Default::default()
            };
            for (i, t) in trays.iter().enumerate() {
                unit.slots[i] = t.map(|(m, c)| AmsSlot::new(m, c));
            }
            out.units.insert(*id, unit);
        }
        out
    }

    #[test]
    fn prefers_matching_colour() {
        let ams = ams(&[(0, &[Some(("PLA", "FFFFFF")), Some(("PLA", "FF0000"))])]);
        let m = map_filaments(&plate(&[(1, "PLA", "FF0000")]), Some(&ams), None);
        assert!(m.is_complete());
        assert_eq!(m.ams_mapping(), vec![1]);
    }

    #[test]
    fn falls_back_to_first_tray_of_type() {
        let ams = ams(&[(
            0,
            &[Some(("PETG", "000000")), None, Some(("pla", "00FF00"))],
        )]);
        let m = map_filaments(&plate(&[(1, "PLA", "FF0000")]), Some(&ams), None);
        assert_eq!(m.ams_mapping(), vec![2]);
    }

    #[test]
    fn trays_are_not_reused() {
        let ams = ams(&[
            (0, &[Some(("PLA", "FFFFFF"))]),
            (1, &[None, Some(("PLA", "FFFFFF"))]),
        ]);
        let m = map_filaments(
            &plate(&[(1, "PLA", "FFFFFF"), (3, "PLA", "FFFFFF")]),
            Some(&ams),
            None,
        );
        assert!(m.use_ams);
        assert_eq!(m.ams_mapping(), vec![0, -1, 5]);
    }

    #[test]
    fn missing_type_is_unmapped() {
        let ams = ams(&[(0, &[Some(("PLA", "FFFFFF"))])]);
        let m = map_filaments(
            &plate(&[(1, "PLA", "FFFFFF"), (2, "TPU", "000000")]),
            Some(&ams),
            None,
        );
        assert!(!m.is_complete());
        assert_eq!(m.unmapped().count(), 1);
        assert_eq!(m.status_text(), "Unmapped: TPU #000000");
    }

    #[test]
    fn external_spool_without_ams() {
        let spool = AmsSlot::new("PLA", "FFFFFF");
        let m = map_filaments(&plate(&[(1, "PLA", "FF0000")]), None, Some(&spool));
        assert!(m.is_complete());
        assert!(!m.use_ams);
        assert!(m.ams_mapping().is_empty());

        let spool = AmsSlot::new("PETG", "FFFFFF");
        let m = map_filaments(&plate(&[(1, "PLA", "FF0000")]), None, Some(&spool));
        assert!(!m.is_complete());
    }

    #[test]
    fn multi_colour_plate_needs_ams() {
        let m = map_filaments(
            &plate(&[(1, "PLA", "FFFFFF"), (2, "PLA", "000000")]),
            None,
            None,
        );
        assert!(!m.is_complete());
    }
}
