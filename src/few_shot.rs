//! Few-shot examples
//!
//! Optional question/SQL pairs from an auxiliary database. The examples
//! closest to the incoming question are shown to the model as worked
//! examples.

use crate::db::DbPool;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use strsim::sorensen_dice;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct FewShotStore {
    examples: Vec<FewShotExample>,
}

impl FewShotStore {
    pub fn new(examples: Vec<FewShotExample>) -> Self {
        Self { examples }
    }

    /// Load every row of `few_shot_examples(question, sql)`.
    pub async fn load(pool: &DbPool) -> Result<Self> {
        let rows = sqlx::query("SELECT question, sql FROM few_shot_examples")
            .fetch_all(pool)
            .await?;
        let examples = rows
            .iter()
            .map(|row| -> std::result::Result<FewShotExample, sqlx::Error> {
                Ok(FewShotExample {
                    question: row.try_get("question")?,
                    sql: row.try_get("sql")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        info!("Loaded {} few-shot examples", examples.len());
        Ok(Self::new(examples))
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// The `k` examples whose questions are most similar to `question`.
    pub fn select(&self, question: &str, k: usize) -> Vec<FewShotExample> {
        let question = question.to_lowercase();
        let mut scored: Vec<(f64, &FewShotExample)> = self
            .examples
            .iter()
            .map(|e| (sorensen_dice(&question, &e.question.to_lowercase()), e))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(_, e)| e.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(question: &str, sql: &str) -> FewShotExample {
        FewShotExample {
            question: question.to_string(),
            sql: sql.to_string(),
        }
    }

    #[test]
    fn test_select_prefers_similar_questions() {
        let store = FewShotStore::new(vec![
            example("Who was the coach in 1999?", "SELECT coach FROM seasons WHERE season = '1999'"),
            example(
                "How many goals did Feyenoord score in 2005?",
                "SELECT SUM(goals) FROM matches WHERE season = '2005'",
            ),
            example("List all stadiums", "SELECT name FROM stadiums"),
        ]);

        let picked = store.select("How many goals did Feyenoord score in the 2010 season?", 1);
        assert_eq!(picked.len(), 1);
        assert!(picked[0].question.contains("goals"));
    }

    #[test]
    fn test_select_caps_at_available() {
        let store = FewShotStore::new(vec![example("a", "SELECT 1")]);
        assert_eq!(store.select("anything", 5).len(), 1);
        assert!(FewShotStore::default().select("anything", 3).is_empty());
    }
}
