//! Name matching: bounded edit distance and glob patterns.

use regex::Regex;

/// Scores a candidate name against a pattern. Implementations must be pure so
/// that repeated queries rank identically.
pub trait FuzzyMatcher: Send + Sync {
    /// `Some(score)` in `(0, 1]` when `candidate` matches `pattern`.
    fn score(&self, candidate: &str, pattern: &str) -> Option<f32>;
}

/// Case-insensitive Levenshtein matching with a distance cap, scored as
/// `1 - distance / max_len`.
#[derive(Debug, Clone, Copy)]
pub struct BoundedEditDistance {
    pub max_distance: usize,
}

impl Default for BoundedEditDistance {
    fn default() -> Self {
        Self { max_distance: 2 }
    }
}

impl FuzzyMatcher for BoundedEditDistance {
    fn score(&self, candidate: &str, pattern: &str) -> Option<f32> {
        let candidate = candidate.to_lowercase();
        let needle: Vec<char> = pattern.to_lowercase().chars().collect();
        let dist = levenshtein_with_max(&candidate, &needle, self.max_distance);
        if dist > self.max_distance {
            return None;
        }
        let max_len = candidate.chars().count().max(needle.len());
        if max_len == 0 {
            return Some(1.0);
        }
        let score = 1.0 - dist as f32 / max_len as f32;
        (score > 0.0).then_some(score)
    }
}

/// Levenshtein distance, returning `max_dist + 1` as soon as the distance is
/// known to exceed `max_dist`.
pub fn levenshtein_with_max(value: &str, needle_chars: &[char], max_dist: usize) -> usize {
    if max_dist == 0 {
        return if value.chars().eq(needle_chars.iter().copied()) {
            0
        } else {
            1
        };
    }

    let n = needle_chars.len();
    if n == 0 {
        let len = value.chars().count();
        return len.min(max_dist + 1);
    }

    // Two DP rows over `value[..i]` x `needle[..j]`.
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr: Vec<usize> = vec![0; n + 1];

    for (i, c) in value.chars().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];

        for j in 1..=n {
            let cost = usize::from(c != needle_chars[j - 1]);
            let deletion = prev[j] + 1;
            let insertion = curr[j - 1] + 1;
            let substitution = prev[j - 1] + cost;
            let d = deletion.min(insertion).min(substitution);
            curr[j] = d;
            row_min = row_min.min(d);
        }

        if row_min > max_dist {
            return max_dist + 1;
        }

        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n].min(max_dist + 1)
}

/// A compiled glob (`*` any run, `?` any single character), anchored at both
/// ends.
#[derive(Debug, Clone)]
pub struct Glob {
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(&c.to_string())),
            }
        }
        source.push('$');
        Ok(Self {
            regex: Regex::new(&source)?,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dist(a: &str, b: &str, max: usize) -> usize {
        let needle: Vec<char> = b.chars().collect();
        levenshtein_with_max(a, &needle, max)
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(dist("deps", "deps", 2), 0);
        assert_eq!(dist("dpes", "deps", 2), 2);
        assert_eq!(dist("dep", "deps", 2), 1);
        assert_eq!(dist("kitten", "sitting", 5), 3);
        assert_eq!(dist("completely", "different", 2), 3);
        assert_eq!(dist("", "abc", 5), 3);
        assert_eq!(dist("abc", "", 1), 2);
    }

    #[test]
    fn bounded_score() {
        let m = BoundedEditDistance { max_distance: 2 };
        assert_relative_eq!(m.score("deps", "DEPS").unwrap(), 1.0);
        assert_relative_eq!(m.score("deps", "dep").unwrap(), 0.75);
        assert_eq!(m.score("deploy", "xyz"), None);
    }

    #[test]
    fn glob_matching() {
        let g = Glob::new("dep*").unwrap();
        assert!(g.is_match("deps"));
        assert!(g.is_match("dep"));
        assert!(!g.is_match("adeps"));
        let g = Glob::new("b?ild.x").unwrap();
        assert!(g.is_match("build.x"));
        assert!(!g.is_match("buildax"));
    }
}
