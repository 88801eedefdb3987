use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use thiserror::Error;

/// Progress flags in pipeline order. A flag may only be set once every earlier flag is set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Stage {
    DetailCrawled,
    DetailParsed,
    ReviewUrlsQueued,
    ReviewUrlsCrawled,
    ReviewsParsed,
    ReviewsAnalyzed,
    ArticlePublished,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::DetailCrawled,
        Stage::DetailParsed,
        Stage::ReviewUrlsQueued,
        Stage::ReviewUrlsCrawled,
        Stage::ReviewsParsed,
        Stage::ReviewsAnalyzed,
        Stage::ArticlePublished,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Bits of every stage strictly before `self`.
    pub fn prefix_mask(self) -> u8 {
        self.bit() - 1
    }

    /// Bits of `self` and every later stage.
    pub fn suffix_mask(self) -> u8 {
        !self.prefix_mask() & FlagSet::FULL_MASK
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DetailCrawled => "detail_crawled",
            Self::DetailParsed => "detail_parsed",
            Self::ReviewUrlsQueued => "review_urls_queued",
            Self::ReviewUrlsCrawled => "review_urls_crawled",
            Self::ReviewsParsed => "reviews_parsed",
            Self::ReviewsAnalyzed => "reviews_analyzed",
            Self::ArticlePublished => "article_published",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::DetailCrawled => "DC",
            Self::DetailParsed => "DP",
            Self::ReviewUrlsQueued => "RQ",
            Self::ReviewUrlsCrawled => "RC",
            Self::ReviewsParsed => "RP",
            Self::ReviewsAnalyzed => "ML",
            Self::ArticlePublished => "AP",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        for stage in Stage::ALL {
            if stage.as_str() == normalized || stage.code().eq_ignore_ascii_case(&normalized) {
                return Ok(stage);
            }
        }
        bail!("unknown stage flag: {value}")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("cannot set {stage}: earlier stages are incomplete ({flags})")]
    PrefixIncomplete { stage: Stage, flags: FlagSet },
    #[error("cannot clear {stage}: later stages are already set ({flags})")]
    SuffixSet { stage: Stage, flags: FlagSet },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlagSet(u8);

impl FlagSet {
    pub const FULL_MASK: u8 = (1 << Stage::ALL.len()) - 1;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::FULL_MASK)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_set(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    /// True when `stage` is the next stage to run: all earlier flags set, this one unset.
    pub fn is_eligible_for(self, stage: Stage) -> bool {
        self.0 & stage.prefix_mask() == stage.prefix_mask() && !self.is_set(stage)
    }

    pub fn is_prefix_closed(self) -> bool {
        (self.0 & (self.0 + 1)) == 0
    }

    pub fn set(&mut self, stage: Stage) -> Result<bool, FlagError> {
        if self.is_set(stage) {
            return Ok(false);
        }
        if self.0 & stage.prefix_mask() != stage.prefix_mask() {
            return Err(FlagError::PrefixIncomplete { stage, flags: *self });
        }
        self.0 |= stage.bit();
        Ok(true)
    }

    pub fn clear(&mut self, stage: Stage) -> Result<bool, FlagError> {
        if !self.is_set(stage) {
            return Ok(false);
        }
        if self.0 & stage.suffix_mask() != stage.bit() {
            return Err(FlagError::SuffixSet { stage, flags: *self });
        }
        self.0 &= !stage.bit();
        Ok(true)
    }

    /// Clears `stage` and every later stage.
    pub fn reset_from(&mut self, stage: Stage) -> bool {
        let before = self.0;
        self.0 &= stage.prefix_mask();
        before != self.0
    }

    pub fn status_line(self) -> String {
        Stage::ALL
            .iter()
            .map(|stage| format!("{}={}", stage.code(), self.is_set(*stage)))
            .collect::<Vec<String>>()
            .join(" ")
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_line())
    }
}

/// A workflow command as accepted on the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WorkflowStep {
    CrawlDetail,
    ParseDetail,
    QueueReviewUrls,
    CrawlReviews,
    ParseReviews,
    Nlp,
    Ml,
    UpdateTopics,
    GenerateData,
    SummaryToFile,
}

impl WorkflowStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrawlDetail => "crawl_detail",
            Self::ParseDetail => "parse_detail",
            Self::QueueReviewUrls => "queue_review_urls",
            Self::CrawlReviews => "crawl_reviews",
            Self::ParseReviews => "parse_reviews",
            Self::Nlp => "nlp",
            Self::Ml => "ml",
            Self::UpdateTopics => "updatetopics",
            Self::GenerateData => "generate_data",
            Self::SummaryToFile => "summary_to_file",
        }
    }

    /// The flag this step completes, if it completes one.
    pub fn target_stage(self) -> Option<Stage> {
        match self {
            Self::CrawlDetail => Some(Stage::DetailCrawled),
            Self::ParseDetail => Some(Stage::DetailParsed),
            Self::QueueReviewUrls => Some(Stage::ReviewUrlsQueued),
            Self::CrawlReviews => Some(Stage::ReviewUrlsCrawled),
            Self::ParseReviews => Some(Stage::ReviewsParsed),
            Self::Ml => Some(Stage::ReviewsAnalyzed),
            Self::Nlp | Self::UpdateTopics | Self::GenerateData | Self::SummaryToFile => None,
        }
    }

    pub fn is_retried(self) -> bool {
        matches!(self, Self::CrawlReviews | Self::ParseReviews)
    }

    /// Expands a command-line step name; `analyze_reviews` runs NLP then ML.
    pub fn parse_list(value: &str) -> anyhow::Result<Vec<WorkflowStep>> {
        let normalized = value.trim().to_ascii_lowercase();
        let steps = match normalized.as_str() {
            "crawl_detail" => vec![Self::CrawlDetail],
            "parse_detail" => vec![Self::ParseDetail],
            "queue_review_urls" => vec![Self::QueueReviewUrls],
            "crawl_reviews" => vec![Self::CrawlReviews],
            "parse_reviews" => vec![Self::ParseReviews],
            "nlp" => vec![Self::Nlp],
            "ml" => vec![Self::Ml],
            "updatetopics" | "update_topics" => vec![Self::UpdateTopics],
            "analyze_reviews" => vec![Self::Nlp, Self::Ml],
            "generate_data" => vec![Self::GenerateData],
            "summary_to_file" => vec![Self::SummaryToFile],
            _ => bail!("unknown workflow step: {value}"),
        };
        Ok(steps)
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
