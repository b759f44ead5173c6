/// Alphabets, aligned sequences and site-pattern compression
///
/// Symbols are resolved to sets of compatible alphabet states through
/// lazily-built static tables. Ambiguity codes map to several states and the
/// unknown/gap symbols map to every state.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{PhyloError, Result};

/// Nucleotide encoding: A=0, C=1, G=2, T=3
const NUCLEOTIDES: [char; 4] = ['A', 'C', 'G', 'T'];

/// State alphabet with symbol aliases.
#[derive(Debug)]
pub struct Alphabet {
    name: &'static str,
    states: Vec<char>,
    aliases: HashMap<char, Vec<usize>>,
    gap: char,
}

static DNA: Lazy<Alphabet> = Lazy::new(|| {
    let mut aliases = HashMap::new();
    for (i, &nt) in NUCLEOTIDES.iter().enumerate() {
        aliases.insert(nt, vec![i]);
    }
    aliases.insert('U', vec![3]);

    // IUPAC ambiguity codes
    let iupac = [
        ('R', "AG"), ('Y', "CT"), ('S', "CG"), ('W', "AT"),
        ('K', "GT"), ('M', "AC"), ('B', "CGT"), ('D', "AGT"),
        ('H', "ACT"), ('V', "ACG"),
    ];
    for (code, nts) in iupac {
        let states = nts
            .chars()
            .filter_map(|c| NUCLEOTIDES.iter().position(|&n| n == c))
            .collect();
        aliases.insert(code, states);
    }
    for unknown in ['N', '?', '-'] {
        aliases.insert(unknown, (0..4).collect());
    }

    Alphabet {
        name: "DNA",
        states: NUCLEOTIDES.to_vec(),
        aliases,
        gap: '-',
    }
});

static BINARY: Lazy<Alphabet> = Lazy::new(|| {
    let mut aliases = HashMap::new();
    aliases.insert('0', vec![0]);
    aliases.insert('1', vec![1]);
    aliases.insert('?', vec![0, 1]);
    aliases.insert('-', vec![0, 1]);
    Alphabet {
        name: "Binary",
        states: vec!['0', '1'],
        aliases,
        gap: '-',
    }
});

impl Alphabet {
    /// Nucleotide alphabet (A, C, G, T) with IUPAC codes
    pub fn dna() -> &'static Alphabet {
        &DNA
    }

    /// Presence/absence alphabet (0, 1)
    pub fn binary() -> &'static Alphabet {
        &BINARY
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Number of resolved states
    pub fn size(&self) -> usize {
        self.states.len()
    }

    pub fn state_char(&self, state: usize) -> Option<char> {
        self.states.get(state).copied()
    }

    /// States compatible with `symbol` (case-insensitive).
    pub fn states_for(&self, symbol: char) -> Option<&[usize]> {
        self.aliases
            .get(&symbol.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    pub fn is_gap(&self, symbol: char) -> bool {
        symbol == self.gap
    }

    /// True when the symbol does not restrict the state at all.
    pub fn is_unknown(&self, symbol: char) -> bool {
        self.states_for(symbol)
            .is_some_and(|s| s.len() == self.size())
    }
}

/// Named, aligned sequences over one alphabet.
#[derive(Debug, Clone)]
pub struct SiteContainer {
    alphabet: &'static Alphabet,
    names: Vec<String>,
    sequences: Vec<Vec<char>>,
}

impl SiteContainer {
    pub fn new(alphabet: &'static Alphabet) -> Self {
        Self {
            alphabet,
            names: Vec::new(),
            sequences: Vec::new(),
        }
    }

    /// Build a container from `(name, sequence)` pairs.
    pub fn from_pairs<S: AsRef<str>>(alphabet: &'static Alphabet, pairs: &[(S, S)]) -> Result<Self> {
        let mut sites = Self::new(alphabet);
        for (name, seq) in pairs {
            sites.add_sequence(name.as_ref(), seq.as_ref())?;
        }
        Ok(sites)
    }

    /// Add a sequence, checking its symbols and its length.
    pub fn add_sequence(&mut self, name: &str, sequence: &str) -> Result<()> {
        if self.names.iter().any(|n| n == name) {
            return Err(PhyloError::invalid_input(format!(
                "duplicate sequence name '{name}'"
            )));
        }
        let symbols: Vec<char> = sequence.chars().collect();
        if let Some(first) = self.sequences.first() {
            if first.len() != symbols.len() {
                return Err(PhyloError::dimension(
                    format!("length of sequence '{name}'"),
                    first.len(),
                    symbols.len(),
                ));
            }
        }
        if let Some((site, &symbol)) = symbols
            .iter()
            .enumerate()
            .find(|(_, &c)| self.alphabet.states_for(c).is_none())
        {
            return Err(PhyloError::UnknownState {
                sequence: name.to_string(),
                site,
                symbol,
            });
        }
        self.names.push(name.to_string());
        self.sequences.push(symbols);
        Ok(())
    }

    pub fn alphabet(&self) -> &'static Alphabet {
        self.alphabet
    }

    pub fn number_of_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn number_of_sites(&self) -> usize {
        self.sequences.first().map_or(0, Vec::len)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn sequence(&self, name: &str) -> Result<&[char]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.sequences[i].as_slice())
            .ok_or_else(|| PhyloError::SequenceNotFound(name.to_string()))
    }
}

/// Distinct alignment columns with their multiplicities.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    alphabet: &'static Alphabet,
    names: Vec<String>,
    /// One column per pattern, one symbol per sequence
    columns: Vec<Vec<char>>,
    weights: Vec<f64>,
    site_to_pattern: Vec<usize>,
}

impl SitePatterns {
    /// Compress identical columns, in order of first appearance. With
    /// `use_patterns = false` every site is its own pattern of weight 1.
    pub fn new(sites: &SiteContainer, use_patterns: bool) -> Self {
        let n_sites = sites.number_of_sites();
        let mut columns: Vec<Vec<char>> = Vec::new();
        let mut weights = Vec::new();
        let mut site_to_pattern = Vec::with_capacity(n_sites);
        let mut seen: HashMap<Vec<char>, usize> = HashMap::new();

        for site in 0..n_sites {
            let column: Vec<char> = sites
                .sequences
                .iter()
                .map(|s| s[site].to_ascii_uppercase())
                .collect();
            let pattern = if use_patterns {
                match seen.get(&column) {
                    Some(&p) => p,
                    None => {
                        seen.insert(column.clone(), columns.len());
                        columns.push(column);
                        weights.push(0.0);
                        columns.len() - 1
                    }
                }
            } else {
                columns.push(column);
                weights.push(0.0);
                columns.len() - 1
            };
            weights[pattern] += 1.0;
            site_to_pattern.push(pattern);
        }

        Self {
            alphabet: sites.alphabet,
            names: sites.names.clone(),
            columns,
            weights,
            site_to_pattern,
        }
    }

    pub fn alphabet(&self) -> &'static Alphabet {
        self.alphabet
    }

    pub fn number_of_patterns(&self) -> usize {
        self.columns.len()
    }

    pub fn number_of_sites(&self) -> usize {
        self.site_to_pattern.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Pattern index of an original alignment column.
    pub fn pattern_of_site(&self, site: usize) -> Result<usize> {
        self.site_to_pattern
            .get(site)
            .copied()
            .ok_or_else(|| PhyloError::invalid_input(format!("site {site} out of range")))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn sequence_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| PhyloError::SequenceNotFound(name.to_string()))
    }

    /// Symbol of sequence `seq` in pattern `pattern`.
    pub fn symbol(&self, seq: usize, pattern: usize) -> char {
        self.columns[pattern][seq]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dna_aliases() {
        let dna = Alphabet::dna();
        assert_eq!(dna.size(), 4);
        assert_eq!(dna.states_for('g'), Some(&[2][..]));
        assert_eq!(dna.states_for('U'), Some(&[3][..]));
        assert_eq!(dna.states_for('R'), Some(&[0, 2][..]));
        assert!(dna.is_unknown('N'));
        assert!(dna.is_gap('-'));
        assert!(dna.states_for('Z').is_none());
    }

    #[test]
    fn test_container_validation() {
        let mut sites = SiteContainer::new(Alphabet::dna());
        sites.add_sequence("A", "ACGT").unwrap();
        assert!(matches!(
            sites.add_sequence("B", "ACG"),
            Err(PhyloError::DimensionMismatch { expected: 4, found: 3, .. })
        ));
        assert!(matches!(
            sites.add_sequence("C", "ACZT"),
            Err(PhyloError::UnknownState { site: 2, symbol: 'Z', .. })
        ));
        assert_eq!(
            sites.sequence("D").unwrap_err(),
            PhyloError::SequenceNotFound("D".into())
        );
    }

    #[test]
    fn test_pattern_compression() {
        let sites = SiteContainer::from_pairs(
            Alphabet::dna(),
            &[("A", "AACAA"), ("B", "AACTA"), ("C", "GGCTG")],
        )
        .unwrap();
        let patterns = SitePatterns::new(&sites, true);
        assert_eq!(patterns.number_of_patterns(), 3);
        assert_eq!(patterns.weights(), &[3.0, 1.0, 1.0]);
        assert_eq!(patterns.pattern_of_site(4).unwrap(), 0);
        assert_eq!(patterns.pattern_of_site(3).unwrap(), 2);
        assert_eq!(patterns.symbol(2, 0), 'G');

        let raw = SitePatterns::new(&sites, false);
        assert_eq!(raw.number_of_patterns(), 5);
        assert!(raw.weights().iter().all(|&w| w == 1.0));
    }
}
