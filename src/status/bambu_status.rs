use std::collections::BTreeMap;

/// Trays per AMS unit
pub const AMS_SLOTS: usize = 4;

#[derive(Debug, Default, Clone)]
pub struct AmsStatus {
    pub units: BTreeMap<i64, AmsUnit>,
}

impl AmsStatus {
    /// All loaded trays, ordered by unit then tray
    pub fn loaded_slots(&self) -> impl Iterator<Item = (i64, usize, &AmsSlot)> {
        self.units.iter().flat_map(|(ams_id, unit)| {
            unit.slots
                .iter()
                .enumerate()
                .filter_map(move |(tray_id, slot)| slot.as_ref().map(|s| (*ams_id, tray_id, s)))
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct AmsUnit {
    pub id: i64,
    pub slots: [Option<AmsSlot>; AMS_SLOTS],
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AmsSlot {
    /// material type, e.g. `PLA`, `PETG-CF`
    pub material: String,
    /// `RRGGBB`, upper case
    pub color: String,
}

impl AmsSlot {
    pub fn new(material: &str, color: &str) -> Self {
        Self {
            material: material.to_string(),
            color: normalize_color(color),
        }
    }
}

/// Reduces `#rrggbb`, `RRGGBBAA` and friends to upper case `RRGGBB`
pub fn normalize_color(color: &str) -> String {
    color
        .trim()
        .trim_start_matches('#')
        .chars()
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_are_normalized() {
        assert_eq!(normalize_color("#ff00aa"), "FF00AA");
        assert_eq!(normalize_color("FF00AAFF"), "FF00AA");
        assert_eq!(normalize_color(""), "");
    }

    #[test]
    fn non_ascii_colors_do_not_split_characters() {
        assert_eq!(normalize_color("#aééé"), "Aééé");
        assert_eq!(normalize_color("ééééééé").chars().count(), 6);
    }

    #[test]
    fn loaded_slots_skips_empty_trays() {
        let mut unit = AmsUnit::default();
        unit.slots[0] = Some(AmsSlot::new("PLA", "FFFFFFFF"));
        unit.slots[2] = Some(AmsSlot::new("PETG", "000000FF"));
        let mut ams = AmsStatus::default();
        ams.units.insert(0, unit);

        let slots: Vec<_> = ams
            .loaded_slots()
            .map(|(a, t, s)| (a, t, s.material.clone()))
            .collect();
        assert_eq!(
            slots,
            vec![(0, 0, "PLA".to_string()), (0, 2, "PETG".to_string())]
        );
    }
}
