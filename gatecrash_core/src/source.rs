use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Probability that a mutation flips the case of an ASCII letter instead of
/// replacing it.
const CASE_FLIP_PROBABILITY: f64 = 0.5;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Wordlist {path:?} could not be opened: {source}")]
    Wordlist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Value source has already been consumed")]
    Exhausted,
}

/// How many times, and for how long, a [`ValueSource`] can produce values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Finite, and every call to [`ValueSource::values`] starts over.
    Restartable,
    /// Finite or not, but only the first call yields anything.
    Once,
    /// Never runs out on its own; the caller has to stop it.
    Unbounded,
}

/// Lazy sequence of candidate values.
pub type Values<'a> = Box<dyn Iterator<Item = String> + Send + 'a>;

/// A `ValueSource` produces the candidate values a fuzzer substitutes into
/// its fuzzing point.
///
/// Sources are pulled lazily, one value per iteration, so an unbounded
/// source costs nothing until it is consumed and can be abandoned at any
/// point between two values.
pub trait ValueSource: Send {
    fn extent(&self) -> Extent;

    /// Starts producing values.
    ///
    /// # Arguments
    /// * `original`: The value the fuzzing point held before fuzzing, if any.
    ///   Sources that derive candidates from it (placement, mutation) use
    ///   it as their base; the others ignore it.
    ///
    /// # Returns
    /// A lazy iterator over the candidates, or
    /// `SourceError::Exhausted` when a consume-once source is asked again.
    fn values(&mut self, original: Option<&str>) -> Result<Values<'_>, SourceError>;
}

/// A fixed list of values.
#[derive(Debug, Clone, Default)]
pub struct Literals {
    values: Vec<String>,
}

impl Literals {
    pub fn new<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl ValueSource for Literals {
    fn extent(&self) -> Extent {
        Extent::Restartable
    }

    fn values(&mut self, _original: Option<&str>) -> Result<Values<'_>, SourceError> {
        Ok(Box::new(self.values.iter().cloned()))
    }
}

/// Where a wordlist entry goes relative to the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// The entry replaces the original value.
    #[default]
    Replace,
    /// The entry is put in front of the original value.
    Prepend,
    /// The entry is put after the original value.
    Append,
}

/// One candidate per line of a file, read lazily. Surrounding whitespace
/// is stripped from every line.
#[derive(Debug, Clone)]
pub struct Wordlist {
    path: PathBuf,
    placement: Placement,
}

impl Wordlist {
    pub fn new(path: impl Into<PathBuf>, placement: Placement) -> Self {
        Self {
            path: path.into(),
            placement,
        }
    }
}

impl ValueSource for Wordlist {
    fn extent(&self) -> Extent {
        Extent::Restartable
    }

    fn values(&mut self, original: Option<&str>) -> Result<Values<'_>, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Wordlist {
            path: self.path.clone(),
            source,
        })?;
        debug!("Reading candidates from {:?}", self.path);

        let original = original.unwrap_or_default().to_string();
        let placement = self.placement;
        let path = self.path.clone();
        let lines = BufReader::new(file).lines().map_while(move |line| match line {
            Ok(line) => Some(line.trim().to_string()),
            Err(e) => {
                warn!("Stopped reading wordlist {:?}: {}", path, e);
                None
            }
        });
        Ok(Box::new(lines.map(move |word| match placement {
            Placement::Replace => word,
            Placement::Prepend => format!("{word}{original}"),
            Placement::Append => format!("{original}{word}"),
        })))
    }
}

/// Wraps an arbitrary iterator. It can be consumed once.
pub struct IterSource {
    iter: Option<Values<'static>>,
    extent: Extent,
}

impl IterSource {
    pub fn new(iter: impl Iterator<Item = String> + Send + 'static) -> Self {
        Self {
            iter: Some(Box::new(iter)),
            extent: Extent::Once,
        }
    }

    /// Like [`IterSource::new`], for iterators that never end.
    pub fn unbounded(iter: impl Iterator<Item = String> + Send + 'static) -> Self {
        Self {
            iter: Some(Box::new(iter)),
            extent: Extent::Unbounded,
        }
    }
}

impl ValueSource for IterSource {
    fn extent(&self) -> Extent {
        self.extent
    }

    fn values(&mut self, _original: Option<&str>) -> Result<Values<'_>, SourceError> {
        self.iter.take().ok_or(SourceError::Exhausted)
    }
}

/// Random single-character mutations of the original value.
///
/// The generator is seeded, so the same seed always yields the same
/// sequence. With a `count` the source is finite and restartable; without
/// one it is unbounded.
#[derive(Debug, Clone)]
pub struct Mutations {
    seed: u64,
    count: Option<usize>,
}

impl Mutations {
    pub fn new(seed: u64, count: Option<usize>) -> Self {
        Self { seed, count }
    }
}

impl ValueSource for Mutations {
    fn extent(&self) -> Extent {
        match self.count {
            Some(_) => Extent::Restartable,
            None => Extent::Unbounded,
        }
    }

    fn values(&mut self, original: Option<&str>) -> Result<Values<'_>, SourceError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let base = original.unwrap_or_default().to_string();
        let mutations = std::iter::repeat_with(move || mutate(&base, &mut rng));
        Ok(match self.count {
            Some(count) => Box::new(mutations.take(count)),
            None => Box::new(mutations),
        })
    }
}

/// Applies one random edit to `value`: flip the case of a letter, replace a
/// character with a printable ASCII one, insert one, or delete one.
///
/// An empty value always gets a single random printable character.
fn mutate<R: Rng + ?Sized>(value: &str, rng: &mut R) -> String {
    let mut chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        chars.push(random_printable(rng));
        return chars.into_iter().collect();
    }

    let index = rng.random_range(0..chars.len());
    match rng.random_range(0..3u8) {
        0 => {
            let c = chars[index];
            if c.is_ascii_alphabetic() && rng.random_bool(CASE_FLIP_PROBABILITY) {
                chars[index] = if c.is_ascii_lowercase() {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                };
            } else {
                chars[index] = random_printable(rng);
            }
        }
        1 => chars.insert(index, random_printable(rng)),
        _ => {
            chars.remove(index);
        }
    }
    chars.into_iter().collect()
}

fn random_printable<R: Rng + ?Sized>(rng: &mut R) -> char {
    // 32..127 is the printable ASCII range.
    rng.random_range(32u8..127u8) as char
}
