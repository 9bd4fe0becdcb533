//! Population statistics over snapshots and recorded history.

use std::collections::BTreeMap;

use serde::Serialize;
use trophic_log::reader::LogReader;
use trophic_log::LogError;
use trophic_store::catalog::EntityCatalog;
use trophic_store::snapshot::TimestepSnapshot;

/// Count and numeric field means of one kind at one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub count: usize,
    /// Mean of every numeric field over the entities that carry it.
    pub means: BTreeMap<String, f64>,
}

/// Population statistics of one timestep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PopulationStats {
    pub index: u64,
    /// Keyed by kind name. Kinds with no living entities are absent.
    pub kinds: BTreeMap<String, KindStats>,
    /// Sum of all grid cells.
    pub total_nutrient: f64,
}

impl PopulationStats {
    /// Compute the statistics of `snapshot`, naming kinds with the catalog
    /// mapping valid at the snapshot's catalog version.
    pub fn from_snapshot(snapshot: &TimestepSnapshot, catalog: &EntityCatalog) -> Self {
        let mut sums: BTreeMap<String, (usize, BTreeMap<String, (f64, usize)>)> = BTreeMap::new();
        for record in snapshot.entities.values() {
            let name = catalog
                .name_for(record.kind, snapshot.catalog_version)
                .unwrap_or_else(|| format!("kind#{}", record.kind.0));
            let (count, fields) = sums.entry(name).or_default();
            *count += 1;
            for (field, value) in &record.fields {
                if let Some(n) = value.as_number() {
                    let (sum, seen) = fields.entry(field.clone()).or_insert((0.0, 0));
                    *sum += n;
                    *seen += 1;
                }
            }
        }

        let kinds = sums
            .into_iter()
            .map(|(name, (count, fields))| {
                let means = fields
                    .into_iter()
                    .map(|(field, (sum, seen))| (field, sum / seen as f64))
                    .collect();
                (name, KindStats { count, means })
            })
            .collect();

        Self {
            index: snapshot.index,
            kinds,
            total_nutrient: snapshot.grid.total(),
        }
    }

    /// Number of living entities of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.kinds.get(kind).map_or(0, |k| k.count)
    }

    pub fn mean(&self, kind: &str, field: &str) -> Option<f64> {
        self.kinds.get(kind)?.means.get(field).copied()
    }

    /// One-line human readable summary, e.g.
    /// `t=12 herbivore=9 producer=14 nutrient=388.20`.
    pub fn summary_line(&self) -> String {
        let mut line = format!("t={}", self.index);
        for (name, kind) in &self.kinds {
            line.push_str(&format!(" {name}={}", kind.count));
        }
        line.push_str(&format!(" nutrient={:.2}", self.total_nutrient));
        line
    }
}

/// Column layout for CSV export: counts of `kinds`, then the mean of every
/// trait in `traits` for each kind that is not listed in `countless`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvLayout {
    pub kinds: Vec<String>,
    pub traits: Vec<String>,
    /// Kinds exported as a count only (e.g. producers without traits).
    pub countless: Vec<String>,
}

impl CsvLayout {
    pub fn new<S: AsRef<str>>(kinds: &[S], traits: &[S], countless: &[S]) -> Self {
        let owned = |names: &[S]| -> Vec<String> {
            names.iter().map(|n| n.as_ref().to_owned()).collect()
        };
        Self {
            kinds: owned(kinds),
            traits: owned(traits),
            countless: owned(countless),
        }
    }

    fn trait_kinds(&self) -> impl Iterator<Item = &String> {
        self.kinds.iter().filter(|k| !self.countless.contains(*k))
    }

    /// `timestep,<kind>,...,<kind>_<trait>,...`
    pub fn header(&self) -> String {
        let mut cells = vec!["timestep".to_owned()];
        cells.extend(self.kinds.iter().cloned());
        for kind in self.trait_kinds() {
            cells.extend(self.traits.iter().map(|t| format!("{kind}_{t}")));
        }
        cells.join(",")
    }

    /// One row for `stats`. Absent kinds count 0 and their means are 0.
    pub fn row(&self, stats: &PopulationStats) -> String {
        let mut cells = vec![stats.index.to_string()];
        cells.extend(self.kinds.iter().map(|k| stats.count(k).to_string()));
        for kind in self.trait_kinds() {
            cells.extend(
                self.traits
                    .iter()
                    .map(|t| format!("{:.4}", stats.mean(kind, t).unwrap_or(0.0))),
            );
        }
        cells.join(",")
    }

    /// Write the header and one row per entry of `history`.
    pub fn write_csv(
        &self,
        history: &[PopulationStats],
        mut out: impl std::io::Write,
    ) -> std::io::Result<()> {
        writeln!(out, "{}", self.header())?;
        for stats in history {
            writeln!(out, "{}", self.row(stats))?;
        }
        Ok(())
    }
}

/// Statistics for every committed index, in index order.
pub fn population_history(
    reader: &LogReader,
    catalog: &EntityCatalog,
) -> Result<Vec<PopulationStats>, LogError> {
    let Some(highest) = reader.highest_index() else {
        return Ok(Vec::new());
    };
    (0..=highest)
        .map(|index| {
            let snapshot = reader.read(index)?;
            Ok(PopulationStats::from_snapshot(&snapshot, catalog))
        })
        .collect()
}
