// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correlator product id to (antenna1, antenna2, Stokes) mapping.
//!
//! Product ids are 1-based and may be sparse. The "standard" map is the
//! closed-form 2628-product arrangement the correlator hardware emits for
//! a 36-antenna array; explicit maps come from the parset. A map can be
//! sliced down to a subset of antennas for sparse-array operation.

use std::collections::BTreeMap;

use crate::config::ConfigError;
use crate::constants::STANDARD_MAP_ANTENNAS;
use crate::parset::Parset;
use crate::stokes::Stokes;

type ProductDesc = (u32, u32, Stokes);

#[derive(Clone, Debug, Default)]
pub struct BaselineMap {
    map: BTreeMap<i32, ProductDesc>,
    upper_triangle: bool,
    lower_triangle: bool,
}

impl BaselineMap {
    /// Build from a `baselinemap.` parset subset: either `name = standard`
    /// or an explicit `baselineids` list with one triple per id.
    pub fn from_parset(parset: &Parset) -> Result<BaselineMap, ConfigError> {
        let name = parset.string_or("name", "");
        let mut bm = BaselineMap {
            map: BTreeMap::new(),
            upper_triangle: true,
            lower_triangle: true,
        };
        if name == "standard" {
            if parset.is_defined("baselineids") {
                return Err(ConfigError::BaselineMapOverspecified);
            }
            bm.default_map_ade(STANDARD_MAP_ANTENNAS as u32);
        } else {
            if !name.is_empty() {
                return Err(ConfigError::UnknownBaselineMapName(name));
            }
            let ids = parset.i32_vector("baselineids")?;
            for id in ids {
                let triple = parset
                    .string_vector(&id.to_string())
                    .map_err(|_| ConfigError::BadBaselineEntry(id))?;
                if triple.len() != 3 {
                    return Err(ConfigError::BadBaselineEntry(id));
                }
                let ant1: u32 = triple[0]
                    .parse()
                    .map_err(|_| ConfigError::BadBaselineEntry(id))?;
                let ant2: u32 = triple[1]
                    .parse()
                    .map_err(|_| ConfigError::BadBaselineEntry(id))?;
                let pol: Stokes = triple[2]
                    .parse()
                    .map_err(|_| ConfigError::BadBaselineEntry(id))?;
                bm.add(id, ant1, ant2, pol);
            }
        }
        Ok(bm)
    }

    /// Generate the closed-form product arrangement for `n_ant` antennas.
    /// Products are 1-based and lower-triangular (first antenna index is
    /// never smaller than the second): for each antenna `a`, XX/YX for
    /// every baseline to a lower-numbered antenna, XX on the diagonal,
    /// then XY/YY over the same baselines including the diagonal.
    fn default_map_ade(&mut self, n_ant: u32) {
        debug_assert!(self.map.is_empty());
        let mut id = 0i32;
        for a in 0..n_ant {
            for b in 0..a {
                id += 1;
                self.add(id, a, b, Stokes::XX);
                id += 1;
                self.add(id, a, b, Stokes::YX);
            }
            id += 1;
            self.add(id, a, a, Stokes::XX);
            for b in 0..=a {
                id += 1;
                self.add(id, a, b, Stokes::XY);
                id += 1;
                self.add(id, a, b, Stokes::YY);
            }
        }
    }

    fn add(&mut self, id: i32, ant1: u32, ant2: u32, pol: Stokes) {
        if ant1 > ant2 {
            self.upper_triangle = false;
        }
        if ant2 > ant1 {
            self.lower_triangle = false;
        }
        self.map.insert(id, (ant1, ant2, pol));
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// The largest id present; needed to size flat per-id lookup buffers
    /// because ids may be sparse.
    pub fn max_id(&self) -> i32 {
        self.map.keys().next_back().copied().unwrap_or(0)
    }

    /// Product description for an id, or `None` if the id is unmapped.
    pub fn product(&self, id: i32) -> Option<ProductDesc> {
        self.map.get(&id).copied()
    }

    pub fn id_to_antenna1(&self, id: i32) -> Option<u32> {
        self.product(id).map(|p| p.0)
    }

    pub fn id_to_antenna2(&self, id: i32) -> Option<u32> {
        self.product(id).map(|p| p.1)
    }

    pub fn id_to_stokes(&self, id: i32) -> Option<Stokes> {
        self.product(id).map(|p| p.2)
    }

    /// Reverse look-up: the id matching a baseline/polarisation
    /// description, if any.
    pub fn get_id(&self, ant1: u32, ant2: u32, pol: Stokes) -> Option<i32> {
        self.map
            .iter()
            .find(|(_, &desc)| desc == (ant1, ant2, pol))
            .map(|(&id, _)| id)
    }

    /// True if ant2 <= ant1 for all ids.
    pub fn is_lower_triangle(&self) -> bool {
        self.lower_triangle && !self.map.is_empty()
    }

    /// True if ant1 <= ant2 for all ids.
    pub fn is_upper_triangle(&self) -> bool {
        self.upper_triangle && !self.map.is_empty()
    }

    /// Iterate over `(id, (ant1, ant2, stokes))` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, ProductDesc)> + '_ {
        self.map.iter().map(|(&id, &desc)| (id, desc))
    }

    /// Keep only products whose antennas are both in `ids`, renumbering
    /// the retained antennas densely from 0. Indices must be strictly
    /// increasing so that the triangle orientation is preserved and no
    /// conjugation arises at the consumer side.
    pub fn slice(&mut self, ids: &[u32]) -> Result<(), ConfigError> {
        let largest = self
            .map
            .values()
            .map(|&(a1, a2, _)| a1.max(a2))
            .max()
            .ok_or(ConfigError::SliceRejectedEverything)?;

        let mut previous: Option<u32> = None;
        for &id in ids {
            if id > largest {
                return Err(ConfigError::SliceIndexOutOfRange {
                    index: id,
                    largest,
                });
            }
            if previous.map_or(false, |p| id <= p) {
                return Err(ConfigError::SliceIndicesNotIncreasing);
            }
            previous = Some(id);
        }

        let renumber = |ant: u32| ids.iter().position(|&x| x == ant).map(|i| i as u32);
        let mut new_map = BTreeMap::new();
        for (&product_id, &(ant1, ant2, pol)) in &self.map {
            if let (Some(new1), Some(new2)) = (renumber(ant1), renumber(ant2)) {
                new_map.insert(product_id, (new1, new2, pol));
            }
        }
        if new_map.is_empty() {
            return Err(ConfigError::SliceRejectedEverything);
        }
        self.map = new_map;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit(entries: &[(i32, &str)]) -> BaselineMap {
        let mut parset = Parset::new();
        let ids: Vec<String> = entries.iter().map(|(id, _)| id.to_string()).collect();
        parset.add("baselineids", &format!("[{}]", ids.join(", ")));
        for (id, triple) in entries {
            parset.add(&id.to_string(), triple);
        }
        BaselineMap::from_parset(&parset).unwrap()
    }

    #[test]
    fn test_lookup() {
        let bm = explicit(&[(0, "[0, 0, XX]"), (1, "[1, 3, XY]"), (4, "[3, 1, YY]")]);
        assert_eq!(bm.get_id(1, 3, Stokes::XY), Some(1));
        assert_eq!(bm.max_id(), 4);
        assert_eq!(bm.size(), 3);
        assert_eq!(bm.id_to_antenna1(0), Some(0));
        assert_eq!(bm.id_to_antenna2(1), Some(3));
        assert_eq!(bm.id_to_stokes(4), Some(Stokes::YY));
        assert_eq!(bm.get_id(3, 1, Stokes::XX), None);
        assert_eq!(bm.product(2), None);
    }

    #[test]
    fn test_default_map() {
        let mut parset = Parset::new();
        parset.add("name", "standard");
        let bm = BaselineMap::from_parset(&parset).unwrap();
        assert_eq!(bm.size(), 2628);
        assert_eq!(bm.max_id(), 2628);
        assert_eq!(bm.product(1), Some((0, 0, Stokes::XX)));
        assert!(bm.is_lower_triangle());
        assert!(!bm.is_upper_triangle());
        // Antenna 1's block starts right after antenna 0's three products.
        assert_eq!(bm.product(4), Some((1, 0, Stokes::XX)));
        assert_eq!(bm.product(5), Some((1, 0, Stokes::YX)));
        assert_eq!(bm.product(6), Some((1, 1, Stokes::XX)));
    }

    #[test]
    fn test_mixed_param_rejected() {
        let mut parset = Parset::new();
        parset.add("name", "standard");
        parset.add("baselineids", "[1]");
        parset.add("1", "[0, 0, XX]");
        assert!(matches!(
            BaselineMap::from_parset(&parset),
            Err(ConfigError::BaselineMapOverspecified)
        ));
    }

    #[test]
    fn test_unknown_map_name_rejected() {
        let mut parset = Parset::new();
        parset.add("name", "beta");
        assert!(matches!(
            BaselineMap::from_parset(&parset),
            Err(ConfigError::UnknownBaselineMapName(_))
        ));
    }

    /// The 21-product 3-antenna upper-triangle arrangement.
    fn upper_triangle_map() -> BaselineMap {
        explicit(&[
            (1, "[0, 0, XX]"),
            (2, "[0, 0, XY]"),
            (3, "[0, 1, XX]"),
            (4, "[0, 1, XY]"),
            (5, "[0, 2, XX]"),
            (6, "[0, 2, XY]"),
            (7, "[0, 0, YY]"),
            (8, "[0, 1, YX]"),
            (9, "[0, 1, YY]"),
            (10, "[0, 2, YX]"),
            (11, "[0, 2, YY]"),
            (12, "[1, 1, XX]"),
            (13, "[1, 1, XY]"),
            (14, "[1, 2, XX]"),
            (15, "[1, 2, XY]"),
            (16, "[1, 1, YY]"),
            (17, "[1, 2, YX]"),
            (18, "[1, 2, YY]"),
            (19, "[2, 2, XX]"),
            (20, "[2, 2, XY]"),
            (21, "[2, 2, YY]"),
        ])
    }

    #[test]
    fn test_slice_map() {
        let mut bm = upper_triangle_map();
        assert_eq!(bm.size(), 21);
        assert!(bm.is_upper_triangle());
        assert!(!bm.is_lower_triangle());

        bm.slice(&[0, 2]).unwrap();

        assert_eq!(bm.size(), 10);
        assert!(bm.is_upper_triangle());
        assert_eq!(bm.max_id(), 21);
        // Products involving antenna 1 become unmapped; antenna 2 is
        // renumbered to 1.
        assert_eq!(bm.product(3), None);
        assert_eq!(bm.product(5), Some((0, 1, Stokes::XX)));
        assert_eq!(bm.product(19), Some((1, 1, Stokes::XX)));
        for (_, (a1, a2, _)) in bm.iter() {
            assert!(a1 < 2 && a2 < 2);
        }
    }

    #[test]
    fn test_slice_with_full_index_list_is_identity() {
        let mut bm = upper_triangle_map();
        let before: Vec<_> = bm.iter().collect();
        bm.slice(&[0, 1, 2]).unwrap();
        let after: Vec<_> = bm.iter().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_slice_rejects_unordered_indices() {
        let mut bm = upper_triangle_map();
        assert!(matches!(
            bm.slice(&[2, 0]),
            Err(ConfigError::SliceIndicesNotIncreasing)
        ));
    }

    #[test]
    fn test_lower_triangle_detection() {
        let bm = explicit(&[
            (1, "[0, 0, XX]"),
            (2, "[0, 0, YX]"),
            (3, "[0, 0, YY]"),
            (4, "[1, 0, XX]"),
            (5, "[1, 0, XY]"),
            (6, "[1, 1, XX]"),
            (7, "[1, 0, YX]"),
        ]);
        assert!(bm.is_lower_triangle());
        assert!(!bm.is_upper_triangle());
    }
}
