//! 答案比对与评分
//!
//! 以答案表（answer key）的题目集合为准逐题比对，识别结果中多出的题目不计入；
//! 未识别到的题目记为错误，`detected` 为 null。

use crate::model::error::OmrError;
use omr_conn::AnswerMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// `/api/validate` 的请求体，字段缺失在评分前报错
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationRequest {
    #[serde(default)]
    pub detected_answers: Option<Value>,
    #[serde(default)]
    pub answer_key: Option<Value>,
}

impl ValidationRequest {
    pub fn into_maps(self) -> Result<(AnswerMap, AnswerMap), OmrError> {
        let mut missing = Vec::new();
        if self.detected_answers.as_ref().map_or(true, Value::is_null) {
            missing.push("detected_answers");
        }
        if self.answer_key.as_ref().map_or(true, Value::is_null) {
            missing.push("answer_key");
        }
        if !missing.is_empty() {
            return Err(OmrError::MissingField(missing));
        }
        Ok((
            as_object("detected_answers", self.detected_answers)?,
            as_object("answer_key", self.answer_key)?,
        ))
    }
}

fn as_object(field: &str, value: Option<Value>) -> Result<AnswerMap, OmrError> {
    match value {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(OmrError::InvalidRequest(format!("{} must be a JSON object", field))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// 下限包含，自上而下第一个命中的档位
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 90.0 {
            Grade::APlus
        } else if percentage >= 80.0 {
            Grade::A
        } else if percentage >= 70.0 {
            Grade::B
        } else if percentage >= 60.0 {
            Grade::C
        } else if percentage >= 50.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionResult {
    pub question: String,
    /// `None` 表示该题未识别到作答
    pub detected: Option<Value>,
    pub correct: Value,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub score: usize,
    pub total: usize,
    pub percentage: f64,
    pub grade: Grade,
    pub comparison: Vec<QuestionResult>,
}

pub fn score(detected: &AnswerMap, key: &AnswerMap) -> ScoreReport {
    let comparison: Vec<QuestionResult> = key
        .iter()
        .map(|(question, correct)| {
            let detected = detected.get(question).cloned();
            let is_correct = detected
                .as_ref()
                .is_some_and(|answer| same_answer(answer, correct));
            QuestionResult {
                question: question.clone(),
                detected,
                correct: correct.clone(),
                is_correct,
            }
        })
        .collect();

    let total = comparison.len();
    let correct = comparison.iter().filter(|row| row.is_correct).count();
    let raw = if total > 0 {
        correct as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    ScoreReport {
        score: correct,
        total,
        percentage: round_percentage(raw),
        // 档位按未取整的百分比判定
        grade: Grade::from_percentage(raw),
        comparison,
    }
}

/// 保留两位小数，按浮点数的精确值取舍，恰好一半时取偶（1/32 → 3.12）
fn round_percentage(raw: f64) -> f64 {
    format!("{:.2}", raw).parse().unwrap_or(raw)
}

/// 数值按大小比较（1 与 1.0 视为相同），其他类型严格相等
fn same_answer(detected: &Value, correct: &Value) -> bool {
    match (detected, correct) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => detected == correct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> AnswerMap {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn key_of(total: usize) -> AnswerMap {
        (1..=total)
            .map(|q| (q.to_string(), json!("A")))
            .collect()
    }

    fn detected_with(correct: usize, total: usize) -> AnswerMap {
        (1..=total)
            .map(|q| (q.to_string(), json!(if q <= correct { "A" } else { "B" })))
            .collect()
    }

    #[test]
    fn percentage_ties_round_to_even() {
        for (correct, total, expected) in [(1, 32, 3.12), (5, 32, 15.62), (1, 3, 33.33), (2, 3, 66.67)] {
            let report = score(&detected_with(correct, total), &key_of(total));
            assert_eq!(report.percentage, expected, "{}/{}", correct, total);
        }
    }

    #[test]
    fn worked_example() {
        let key = map(json!({"1": "A", "2": "B", "3": "C"}));
        let detected = map(json!({"1": "A", "2": "C"}));
        let report = score(&detected, &key);

        assert_eq!(report.score, 1);
        assert_eq!(report.total, 3);
        assert_eq!(report.percentage, 33.33);
        assert_eq!(report.grade, Grade::F);
        let rows: Vec<(&str, Option<&Value>, &Value, bool)> = report
            .comparison
            .iter()
            .map(|r| (r.question.as_str(), r.detected.as_ref(), &r.correct, r.is_correct))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("1", Some(&json!("A")), &json!("A"), true),
                ("2", Some(&json!("C")), &json!("B"), false),
                ("3", None, &json!("C"), false),
            ]
        );

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["grade"], json!("F"));
        assert_eq!(value["comparison"][2]["detected"], Value::Null);
    }

    #[test]
    fn perfect_detection_is_a_plus() {
        let key = map(json!({"1": "A", "2": "D", "10": "B", "q4": 3}));
        let report = score(&key, &key);
        assert_eq!(report.percentage, 100.0);
        assert_eq!(report.grade, Grade::APlus);
        assert_eq!(serde_json::to_value(report.grade).unwrap(), json!("A+"));
    }

    #[test]
    fn empty_key_scores_zero() {
        let report = score(&AnswerMap::new(), &AnswerMap::new());
        assert_eq!(report.total, 0);
        assert_eq!(report.score, 0);
        assert_eq!(report.percentage, 0.0);
        assert_eq!(report.grade, Grade::F);
        assert!(report.comparison.is_empty());
    }

    #[test]
    fn comparison_follows_key_and_ignores_extras() {
        let key = map(json!({"3": "C", "1": "A"}));
        let detected = map(json!({"1": "A", "2": "B", "3": "C", "99": "D"}));
        let report = score(&detected, &key);
        let questions: Vec<&str> = report.comparison.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(questions, vec!["3", "1"]);
        assert_eq!(report.score, 2);
        assert_eq!(report.total, 2);
    }

    #[test]
    fn explicit_null_detection_is_incorrect() {
        let key = map(json!({"1": "A"}));
        let detected = map(json!({"1": null}));
        let report = score(&detected, &key);
        assert!(!report.comparison[0].is_correct);
        assert_eq!(report.comparison[0].detected, Some(Value::Null));
    }

    #[test]
    fn numeric_answers_compare_by_value() {
        let key = map(json!({"1": 2, "2": "2"}));
        let detected = map(json!({"1": 2.0, "2": 2}));
        let report = score(&detected, &key);
        assert!(report.comparison[0].is_correct);
        assert!(!report.comparison[1].is_correct);
    }

    #[test]
    fn inputs_are_not_mutated() {
        let key = map(json!({"1": "A", "2": "B"}));
        let detected = map(json!({"2": "B"}));
        let (key_before, detected_before) = (key.clone(), detected.clone());
        let first = score(&detected, &key);
        let second = score(&detected, &key);
        assert_eq!(first, second);
        assert_eq!(key, key_before);
        assert_eq!(detected, detected_before);
    }

    #[test]
    fn grade_boundaries() {
        let cases = [
            (90.0, Grade::APlus),
            (89.99, Grade::A),
            (80.0, Grade::A),
            (79.99, Grade::B),
            (70.0, Grade::B),
            (69.99, Grade::C),
            (60.0, Grade::C),
            (59.99, Grade::D),
            (50.0, Grade::D),
            (49.99, Grade::F),
            (0.0, Grade::F),
        ];
        for (percentage, grade) in cases {
            assert_eq!(Grade::from_percentage(percentage), grade, "{percentage}");
        }
    }

    #[test]
    fn grade_uses_unrounded_percentage() {
        // 18000/20001 = 89.9955%，展示值取整为 90，档位仍为 A
        let key: AnswerMap = (0..20001).map(|i| (i.to_string(), json!("A"))).collect();
        let detected: AnswerMap = (0..18000).map(|i| (i.to_string(), json!("A"))).collect();
        let report = score(&detected, &key);
        assert_eq!(report.score, 18000);
        assert_eq!(report.percentage, 90.0);
        assert_eq!(report.grade, Grade::A);
    }

    #[test]
    fn request_requires_both_maps() {
        let err = ValidationRequest {
            detected_answers: Some(json!({})),
            answer_key: None,
        }
        .into_maps()
        .unwrap_err();
        assert_eq!(err, OmrError::MissingField(vec!["answer_key"]));

        let err = ValidationRequest::default().into_maps().unwrap_err();
        assert_eq!(
            err,
            OmrError::MissingField(vec!["detected_answers", "answer_key"])
        );

        let err = ValidationRequest {
            detected_answers: Some(json!(["A"])),
            answer_key: Some(json!({})),
        }
        .into_maps()
        .unwrap_err();
        assert!(matches!(err, OmrError::InvalidRequest(_)));
    }
}
