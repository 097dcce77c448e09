//! 猜题评分
//!
//! 将玩家输入的猜测与原文做归一化（小写、去掉全部空白）后，
//! 以 Levenshtein 编辑距离计算 0–100 的匹配分。

/// 默认通过阈值（≥ 该分数即判定猜中）
pub const DEFAULT_PASS_THRESHOLD: u8 = 75;

/// 一次猜题的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuessOutcome {
    Win { score: u8 },
    /// `guess` 保留玩家原始输入（未归一化），用于结果页展示
    Loss { score: u8, guess: String },
}

impl GuessOutcome {
    pub fn score(&self) -> u8 {
        match self {
            GuessOutcome::Win { score } | GuessOutcome::Loss { score, .. } => *score,
        }
    }

    pub fn is_win(&self) -> bool {
        matches!(self, GuessOutcome::Win { .. })
    }
}

fn normalize(s: &str) -> Vec<char> {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// 经典 Levenshtein 距离（插入、删除、替换代价均为 1）
///
/// 表的行对应 `target`，列对应 `guess`。
pub fn levenshtein(target: &[char], guess: &[char]) -> usize {
    let rows = target.len() + 1;
    let cols = guess.len() + 1;
    let mut table = vec![vec![0usize; cols]; rows];

    for (i, row) in table.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..cols {
        table[0][j] = j;
    }

    for i in 1..rows {
        for j in 1..cols {
            let cost = if target[i - 1] == guess[j - 1] { 0 } else { 1 };
            table[i][j] = (table[i - 1][j] + 1)
                .min(table[i][j - 1] + 1)
                .min(table[i - 1][j - 1] + cost);
        }
    }

    table[rows - 1][cols - 1]
}

/// 计算匹配分 `floor((max_len - distance) / max_len * 100)`
pub fn match_score(guess: &str, target: &str) -> u8 {
    let s1 = normalize(guess);
    let s2 = normalize(target);

    if s1 == s2 {
        return 100;
    }
    if s1.is_empty() || s2.is_empty() {
        return 0;
    }

    let distance = levenshtein(&s2, &s1);
    let max_len = s1.len().max(s2.len());
    // 整数运算等价于向下取整，避免浮点误差
    ((max_len - distance) * 100 / max_len) as u8
}

/// 按阈值判定猜题结果
pub fn grade_guess(guess: &str, target: &str, pass_threshold: u8) -> GuessOutcome {
    let score = match_score(guess, target);
    if score >= pass_threshold {
        GuessOutcome::Win { score }
    } else {
        GuessOutcome::Loss {
            score,
            guess: guess.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_100() {
        for s in ["hello", "", "PIZZA PARTY!", "🍕 time"] {
            assert_eq!(match_score(s, s), 100);
        }
        assert_eq!(match_score("hello", "hello"), 100);
    }

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(match_score("Pizza  Party", "pizzaparty"), 100);
        assert_eq!(match_score(" running\tlate ", "RUNNING LATE"), 100);
    }

    #[test]
    fn documented_examples() {
        assert_eq!(match_score("helo", "hello"), 80);
        assert_eq!(match_score("cat", "dog"), 0);
    }

    #[test]
    fn disjoint_equal_length_scores_zero() {
        assert_eq!(match_score("abcd", "wxyz"), 0);
        assert_eq!(match_score("aaa", "bbb"), 0);
    }

    #[test]
    fn empty_side_scores_zero() {
        assert_eq!(match_score("", "hello"), 0);
        assert_eq!(match_score("   ", "hello"), 0);
        assert_eq!(match_score("hello", ""), 0);
    }

    #[test]
    fn score_is_symmetric() {
        let pairs = [
            ("kitten", "sitting"),
            ("running late", "run late"),
            ("abc", "abcdef"),
            ("pizza party", "pizzza partey"),
        ];
        for (a, b) in pairs {
            assert_eq!(match_score(a, b), match_score(b, a), "{} / {}", a, b);
        }
    }

    #[test]
    fn levenshtein_table_base_cases() {
        let k: Vec<char> = "kitten".chars().collect();
        let s: Vec<char> = "sitting".chars().collect();
        assert_eq!(levenshtein(&k, &s), 3);
        assert_eq!(levenshtein(&k, &[]), 6);
        assert_eq!(levenshtein(&[], &s), 7);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // 一个字符差异：5 个字符中 4 个一致
        assert_eq!(match_score("café!", "cafe!"), 80);
    }

    #[test]
    fn grade_uses_threshold_and_keeps_raw_guess() {
        assert_eq!(
            grade_guess("helo", "hello", DEFAULT_PASS_THRESHOLD),
            GuessOutcome::Win { score: 80 }
        );
        let outcome = grade_guess("  Pizza Night ", "pizza party", DEFAULT_PASS_THRESHOLD);
        match outcome {
            GuessOutcome::Loss { score, ref guess } => {
                assert!(score < DEFAULT_PASS_THRESHOLD);
                assert_eq!(guess, "  Pizza Night ");
            }
            _ => panic!("expected loss"),
        }
        assert!(grade_guess("helo", "hello", 90).score() == 80);
        assert!(!grade_guess("helo", "hello", 90).is_win());
    }
}
