use std::{collections::BTreeMap, convert::TryFrom, fmt, str::FromStr};

use derive_more::{From, Into};
use rand::{seq::SliceRandom, Rng};
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Dataset;
use crate::{ClientId, ConfigurationError};

/// The assignment of training samples to clients.
///
/// Every client of the population has an entry, possibly empty. A sample is
/// assigned to at most one client. The split is computed once per experiment
/// and reused verbatim after a resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, From, Into, Serialize, Deserialize)]
pub struct DataSplit(BTreeMap<ClientId, Vec<usize>>);

impl DataSplit {
    /// Gets the sample indices of a client.
    pub fn get(&self, id: ClientId) -> Option<&[usize]> {
        self.0.get(&id).map(Vec::as_slice)
    }

    /// The number of clients in the split.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &[usize])> {
        self.0.iter().map(|(id, indices)| (*id, indices.as_slice()))
    }

    /// The number of samples assigned to any client.
    pub fn total_samples(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Checks that no sample is assigned twice and every index is below `len`.
    pub fn is_valid_for(&self, len: usize) -> bool {
        let mut seen = vec![false; len];
        for index in self.0.values().flatten() {
            match seen.get_mut(*index) {
                Some(s) if !*s => *s = true,
                _ => return false,
            }
        }
        true
    }
}

/// How the training samples are distributed over the clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SplitMode {
    /// Uniformly at random, near-equal partition sizes.
    Iid,
    /// Every client holds samples of at most this many labels.
    LabelShards(usize),
    /// Per-label client proportions drawn from a symmetric Dirichlet distribution.
    Dirichlet(f64),
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iid => write!(f, "iid"),
            Self::LabelShards(k) => write!(f, "non-iid-l-{}", k),
            Self::Dirichlet(alpha) => write!(f, "non-iid-d-{}", alpha),
        }
    }
}

impl FromStr for SplitMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ConfigurationError::UnknownSplitMode(s.to_string());
        if s == "iid" {
            return Ok(Self::Iid);
        }
        if let Some(k) = s.strip_prefix("non-iid-l-") {
            return match k.parse::<usize>() {
                Ok(k) if k > 0 => Ok(Self::LabelShards(k)),
                _ => Err(unknown()),
            };
        }
        if let Some(alpha) = s.strip_prefix("non-iid-d-") {
            return match alpha.parse::<f64>() {
                Ok(alpha) if alpha > 0.0 && alpha.is_finite() => Ok(Self::Dirichlet(alpha)),
                _ => Err(unknown()),
            };
        }
        Err(unknown())
    }
}

impl TryFrom<String> for SplitMode {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SplitMode> for String {
    fn from(mode: SplitMode) -> Self {
        mode.to_string()
    }
}

/// Splits the training samples of `dataset` over `num_clients` clients.
///
/// # Errors
/// Fails if the concentration of a Dirichlet split is not a valid parameter.
pub fn split_dataset<R: Rng + ?Sized>(
    dataset: &Dataset,
    num_clients: usize,
    mode: SplitMode,
    rng: &mut R,
) -> Result<DataSplit, ConfigurationError> {
    let mut split: BTreeMap<ClientId, Vec<usize>> = (0..num_clients as ClientId)
        .map(|id| (id, Vec::new()))
        .collect();
    if num_clients == 0 {
        return Ok(DataSplit(split));
    }

    match mode {
        SplitMode::Iid => {
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            indices.shuffle(rng);
            deal(&indices, num_clients, &mut split);
        }
        SplitMode::LabelShards(k) => {
            let classes = dataset.num_classes();
            let per_label = indices_per_label(dataset, rng);
            let mut order: Vec<usize> = (0..classes).collect();
            order.shuffle(rng);

            // client i holds labels order[(i * k + j) % classes] for j in 0..k
            let mut holders: Vec<Vec<usize>> = vec![Vec::new(); classes];
            for client in 0..num_clients {
                for j in 0..k.min(classes) {
                    holders[order[(client * k + j) % classes]].push(client);
                }
            }
            for (label, clients) in holders.iter().enumerate() {
                if clients.is_empty() {
                    continue;
                }
                let chunks = chunk_sizes(per_label[label].len(), clients.len());
                let mut start = 0;
                for (client, size) in clients.iter().zip(chunks) {
                    if let Some(entry) = split.get_mut(&(*client as ClientId)) {
                        entry.extend_from_slice(&per_label[label][start..start + size]);
                    }
                    start += size;
                }
            }
        }
        SplitMode::Dirichlet(alpha) => {
            let per_label = indices_per_label(dataset, rng);
            let dirichlet = if num_clients > 1 {
                let dirichlet = Dirichlet::new(&vec![alpha; num_clients]).map_err(|err| {
                    ConfigurationError::InvalidSplit(format!("{}: {}", mode, err))
                })?;
                Some(dirichlet)
            } else {
                None
            };
            for indices in per_label.iter() {
                let proportions = match &dirichlet {
                    Some(d) => d.sample(rng),
                    None => vec![1.0],
                };
                let mut start = 0;
                let mut cumulative = 0.0;
                for (client, p) in proportions.iter().enumerate() {
                    cumulative += p;
                    let end = if client + 1 == num_clients {
                        indices.len()
                    } else {
                        ((cumulative * indices.len() as f64).round() as usize)
                            .clamp(start, indices.len())
                    };
                    if let Some(entry) = split.get_mut(&(client as ClientId)) {
                        entry.extend_from_slice(&indices[start..end]);
                    }
                    start = end;
                }
            }
        }
    }

    for indices in split.values_mut() {
        indices.sort_unstable();
    }
    debug!(
        "split {} samples over {} clients ({})",
        dataset.len(),
        num_clients,
        mode
    );
    Ok(DataSplit(split))
}

fn indices_per_label<R: Rng + ?Sized>(dataset: &Dataset, rng: &mut R) -> Vec<Vec<usize>> {
    let mut per_label = vec![Vec::new(); dataset.num_classes()];
    for (index, &label) in dataset.labels().iter().enumerate() {
        per_label[label as usize].push(index);
    }
    for indices in per_label.iter_mut() {
        indices.shuffle(rng);
    }
    per_label
}

fn chunk_sizes(len: usize, parts: usize) -> impl Iterator<Item = usize> {
    (0..parts).map(move |i| len / parts + usize::from(i < len % parts))
}

fn deal(indices: &[usize], num_clients: usize, split: &mut BTreeMap<ClientId, Vec<usize>>) {
    let mut start = 0;
    for (client, size) in chunk_sizes(indices.len(), num_clients).enumerate() {
        if let Some(entry) = split.get_mut(&(client as ClientId)) {
            entry.extend_from_slice(&indices[start..start + size]);
        }
        start += size;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn dataset(len: usize, classes: usize) -> Dataset {
        let labels = (0..len).map(|i| (i % classes) as u32).collect();
        Dataset::new(Array2::zeros((len, 2)), labels, classes).unwrap()
    }

    #[test]
    fn test_parse_split_mode() {
        assert_eq!("iid".parse::<SplitMode>().unwrap(), SplitMode::Iid);
        assert_eq!(
            "non-iid-l-2".parse::<SplitMode>().unwrap(),
            SplitMode::LabelShards(2)
        );
        assert_eq!(
            "non-iid-d-0.3".parse::<SplitMode>().unwrap(),
            SplitMode::Dirichlet(0.3)
        );
        for bad in &["", "non-iid", "non-iid-l-0", "non-iid-d--1", "noniid-l-2"] {
            assert!(matches!(
                bad.parse::<SplitMode>(),
                Err(ConfigurationError::UnknownSplitMode(_))
            ));
        }
    }

    #[test]
    fn test_iid_split() {
        let data = dataset(103, 4);
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let split = split_dataset(&data, 10, SplitMode::Iid, &mut rng).unwrap();

        assert_eq!(split.len(), 10);
        assert_eq!(split.total_samples(), 103);
        assert!(split.is_valid_for(103));
        let sizes: BTreeSet<usize> = split.iter().map(|(_, i)| i.len()).collect();
        assert_eq!(sizes, vec![10, 11].into_iter().collect());
    }

    #[test]
    fn test_label_shard_split() {
        let data = dataset(200, 10);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let split = split_dataset(&data, 8, SplitMode::LabelShards(2), &mut rng).unwrap();

        assert_eq!(split.len(), 8);
        assert!(split.is_valid_for(200));
        for (_, indices) in split.iter() {
            let labels: BTreeSet<u32> = indices.iter().map(|&i| data.labels()[i]).collect();
            assert!(labels.len() <= 2);
        }
    }

    #[test]
    fn test_dirichlet_split() {
        let data = dataset(500, 5);
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let split = split_dataset(&data, 6, SplitMode::Dirichlet(0.5), &mut rng).unwrap();

        assert_eq!(split.len(), 6);
        assert_eq!(split.total_samples(), 500);
        assert!(split.is_valid_for(500));
    }

    #[test]
    fn test_invalid_dirichlet_concentration() {
        let data = dataset(50, 5);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for alpha in &[0.0, -1.0, f64::NAN] {
            assert!(matches!(
                split_dataset(&data, 4, SplitMode::Dirichlet(*alpha), &mut rng),
                Err(ConfigurationError::InvalidSplit(_))
            ));
        }
        // a single client takes every sample without sampling proportions
        let split = split_dataset(&data, 1, SplitMode::Dirichlet(0.0), &mut rng).unwrap();
        assert_eq!(split.total_samples(), 50);
    }

    #[test]
    fn test_split_is_deterministic() {
        let data = dataset(100, 3);
        let a = split_dataset(
            &data,
            4,
            SplitMode::Iid,
            &mut ChaCha20Rng::seed_from_u64(9),
        )
        .unwrap();
        let b = split_dataset(
            &data,
            4,
            SplitMode::Iid,
            &mut ChaCha20Rng::seed_from_u64(9),
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
