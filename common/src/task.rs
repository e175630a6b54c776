use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{EvalError, Result};

pub type TaskName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Pretrain,
    Posttrain,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Pretrain => write!(f, "pretrain"),
            TaskKind::Posttrain => write!(f, "posttrain"),
        }
    }
}

/// Categorical grouping used by reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    GeneralAbilities,
    FactualAgnostic,
    FactualRegional,
}

const GENERAL_PREFIXES: &[&str] = &[
    "hellaswag", "piqa", "arc", "ai2_arc", "winogrande", "xwinograd", "xnli", "copa", "xcopa",
];
const AGNOSTIC_PREFIXES: &[&str] = &["mmlu", "global_mmlu"];
const REGIONAL_PREFIXES: &[&str] = &["include", "switzerland_qa"];

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::GeneralAbilities,
        Dimension::FactualAgnostic,
        Dimension::FactualRegional,
    ];

    /// Infers the dimension from the task name prefix.
    pub fn infer(name: &str) -> Result<Dimension> {
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| name.starts_with(p));

        if starts(GENERAL_PREFIXES) {
            Ok(Dimension::GeneralAbilities)
        } else if starts(AGNOSTIC_PREFIXES) {
            Ok(Dimension::FactualAgnostic)
        } else if starts(REGIONAL_PREFIXES) {
            Ok(Dimension::FactualRegional)
        } else {
            Err(EvalError::Inference(format!(
                "could not infer dimension for task {name}"
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::GeneralAbilities => "general_abilities",
            Dimension::FactualAgnostic => "factual_agnostic",
            Dimension::FactualRegional => "factual_regional",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// English language names accepted as task-name suffixes, with their ISO 639-1 code.
const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("albanian", "sq"),
    ("arabic", "ar"),
    ("armenian", "hy"),
    ("basque", "eu"),
    ("belarusian", "be"),
    ("bengali", "bn"),
    ("bulgarian", "bg"),
    ("catalan", "ca"),
    ("chinese", "zh"),
    ("croatian", "hr"),
    ("czech", "cs"),
    ("danish", "da"),
    ("dutch", "nl"),
    ("english", "en"),
    ("estonian", "et"),
    ("finnish", "fi"),
    ("french", "fr"),
    ("georgian", "ka"),
    ("german", "de"),
    ("greek", "el"),
    ("hebrew", "he"),
    ("hindi", "hi"),
    ("hungarian", "hu"),
    ("icelandic", "is"),
    ("indonesian", "id"),
    ("italian", "it"),
    ("japanese", "ja"),
    ("korean", "ko"),
    ("latvian", "lv"),
    ("lithuanian", "lt"),
    ("macedonian", "mk"),
    ("norwegian", "no"),
    ("persian", "fa"),
    ("polish", "pl"),
    ("portuguese", "pt"),
    ("romanian", "ro"),
    ("romansh", "rm"),
    ("russian", "ru"),
    ("serbian", "sr"),
    ("slovak", "sk"),
    ("slovenian", "sl"),
    ("spanish", "es"),
    ("swahili", "sw"),
    ("swedish", "sv"),
    ("tamil", "ta"),
    ("telugu", "te"),
    ("thai", "th"),
    ("turkish", "tr"),
    ("ukrainian", "uk"),
    ("urdu", "ur"),
    ("vietnamese", "vi"),
];

/// Locale tag for a task name: no suffix means English, a two-letter suffix is
/// already a code, otherwise the suffix is looked up as an English language name.
/// Unknown names are kept lower-cased as the tag.
pub fn infer_language(name: &str) -> String {
    let chunks: Vec<&str> = name.split('_').collect();
    if chunks.len() == 1 {
        return "en".to_string();
    }

    let last = chunks[chunks.len() - 1].to_lowercase();
    if last.len() == 2 {
        return last;
    }

    LANGUAGE_NAMES
        .iter()
        .find(|(full, _)| *full == last)
        .map(|(_, code)| code.to_string())
        .unwrap_or(last)
}

/// One evaluation task of the catalog. Identity is the name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: TaskName,
    /// Row count, the balancing quantity for partitioning.
    pub weight: u64,
    pub kinds: BTreeSet<TaskKind>,
    pub language: Option<String>,
    pub dimension: Dimension,
    /// Alternate result keys; when present, every alias must be completed.
    #[serde(default)]
    pub aliases: Vec<TaskName>,
}

impl Task {
    /// Names whose presence in results marks this task as done.
    pub fn completion_markers(&self) -> impl Iterator<Item = &str> {
        let own = if self.aliases.is_empty() {
            Some(self.name.as_str())
        } else {
            None
        };
        own.into_iter().chain(self.aliases.iter().map(String::as_str))
    }

    pub fn has_kind(&self, kind: TaskKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, aliases: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            weight: 1,
            kinds: BTreeSet::from([TaskKind::Pretrain]),
            language: None,
            dimension: Dimension::GeneralAbilities,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn dimension_is_inferred_from_prefix() {
        assert_eq!(Dimension::infer("hellaswag").unwrap(), Dimension::GeneralAbilities);
        assert_eq!(Dimension::infer("xcopa_it").unwrap(), Dimension::GeneralAbilities);
        assert_eq!(Dimension::infer("global_mmlu_de").unwrap(), Dimension::FactualAgnostic);
        assert_eq!(
            Dimension::infer("include_base_44_german").unwrap(),
            Dimension::FactualRegional
        );
        assert!(matches!(
            Dimension::infer("gsm8k"),
            Err(EvalError::Inference(_))
        ));
    }

    #[test]
    fn language_suffixes() {
        assert_eq!(infer_language("hellaswag"), "en");
        assert_eq!(infer_language("global_mmlu_de"), "de");
        assert_eq!(infer_language("include_base_44_German"), "de");
        assert_eq!(infer_language("switzerland_qa_romansh"), "rm");
        assert_eq!(infer_language("ai2_arc"), "arc");
    }

    /// Without aliases the marker is the name itself; with aliases, only the aliases.
    #[test]
    fn completion_markers_use_aliases_when_present() {
        let plain = task("mmlu", &[]);
        assert_eq!(plain.completion_markers().collect::<Vec<_>>(), vec!["mmlu"]);

        let aliased = task("blend", &["blend_a", "blend_b"]);
        assert_eq!(
            aliased.completion_markers().collect::<Vec<_>>(),
            vec!["blend_a", "blend_b"]
        );
    }

    #[test]
    fn identity_is_by_name() {
        let mut a = task("piqa", &[]);
        let b = task("piqa", &["x"]);
        a.weight = 99;
        assert_eq!(a, b);
    }
}
