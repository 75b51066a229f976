// 该文件是 Liangcang （粮仓） 项目的一部分。
// src/tally.rs - 识别类别过滤与限额计数
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 每个节拍从零开始计数，不跨帧累计：
//! 物品移出画面后，对应类别的计数与超限状态随之消失。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use crate::model::Detection;

/// 默认识别的物品类别
pub const DEFAULT_RECOGNIZED_CLASSES: [&str; 5] = ["banana", "carrot", "bottle", "broccoli", "donut"];

/// 默认每次结账的限额
pub const DEFAULT_CLASS_LIMITS: [(&str, u32); 5] = [
  ("banana", 1),
  ("carrot", 2),
  ("bottle", 1),
  ("broccoli", 2),
  ("donut", 2),
];

#[derive(Error, Debug, PartialEq)]
pub enum RulesError {
  #[error("限额格式应为 类别=数量, 实际为 '{0}'")]
  MalformedLimit(String),
  #[error("类别 '{0}' 的限额无效: {1}")]
  InvalidLimit(String, std::num::ParseIntError),
  #[error("类别名为空")]
  EmptyClass,
}

/// 识别类别白名单
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedClasses(BTreeSet<String>);

impl RecognizedClasses {
  pub fn new<I, S>(classes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(classes.into_iter().map(Into::into).collect())
  }

  pub fn contains(&self, class: &str) -> bool {
    self.0.contains(class)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl Default for RecognizedClasses {
  fn default() -> Self {
    Self::new(DEFAULT_RECOGNIZED_CLASSES)
  }
}

/// 一条 `类别=数量` 形式的限额配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLimit {
  pub class: String,
  pub limit: u32,
}

impl FromStr for ClassLimit {
  type Err = RulesError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (class, limit) = s
      .split_once('=')
      .ok_or_else(|| RulesError::MalformedLimit(s.to_string()))?;
    let class = class.trim();
    if class.is_empty() {
      return Err(RulesError::EmptyClass);
    }
    let limit = limit
      .trim()
      .parse()
      .map_err(|e| RulesError::InvalidLimit(class.to_string(), e))?;
    Ok(ClassLimit {
      class: class.to_string(),
      limit,
    })
  }
}

impl fmt::Display for ClassLimit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}={}", self.class, self.limit)
  }
}

/// 每类限额表，运行期不可变
///
/// 表中没有的类别视为不限量。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLimits(BTreeMap<String, u32>);

impl ClassLimits {
  pub fn new<I>(limits: I) -> Self
  where
    I: IntoIterator<Item = ClassLimit>,
  {
    Self(limits.into_iter().map(|l| (l.class, l.limit)).collect())
  }

  pub fn limit_for(&self, class: &str) -> Option<u32> {
    self.0.get(class).copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
    self.0.iter().map(|(class, limit)| (class.as_str(), *limit))
  }
}

impl Default for ClassLimits {
  fn default() -> Self {
    Self::new(DEFAULT_CLASS_LIMITS.iter().map(|(class, limit)| ClassLimit {
      class: class.to_string(),
      limit: *limit,
    }))
  }
}

/// 只保留白名单内的检测，保持原有顺序
pub fn filter(detections: &[Detection], recognized: &RecognizedClasses) -> Vec<Detection> {
  detections
    .iter()
    .filter(|d| recognized.contains(&d.class))
    .cloned()
    .collect()
}

/// 单个类别的计数结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassTally {
  pub count: u32,
  pub limit: Option<u32>,
  pub exceeded: bool,
}

impl ClassTally {
  fn new(count: u32, limit: Option<u32>) -> Self {
    Self {
      count,
      limit,
      exceeded: limit.is_some_and(|limit| count > limit),
    }
  }
}

/// 当前帧的计数结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallyResult {
  classes: BTreeMap<String, ClassTally>,
}

impl TallyResult {
  pub fn get(&self, class: &str) -> Option<&ClassTally> {
    self.classes.get(class)
  }

  pub fn count(&self, class: &str) -> u32 {
    self.get(class).map(|t| t.count).unwrap_or(0)
  }

  pub fn is_exceeded(&self, class: &str) -> bool {
    self.get(class).is_some_and(|t| t.exceeded)
  }

  pub fn any_exceeded(&self) -> bool {
    self.classes.values().any(|t| t.exceeded)
  }

  pub fn exceeded_classes(&self) -> impl Iterator<Item = &str> {
    self
      .classes
      .iter()
      .filter(|(_, t)| t.exceeded)
      .map(|(class, _)| class.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassTally)> {
    self.classes.iter().map(|(class, t)| (class.as_str(), t))
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  /// 兼容旧接口的物品字符串：每个类别按计数重复，逗号分隔
  pub fn items_summary(&self) -> String {
    self
      .classes
      .iter()
      .flat_map(|(class, t)| std::iter::repeat_n(class.as_str(), t.count as usize))
      .collect::<Vec<_>>()
      .join(", ")
  }

  pub fn to_json(&self) -> Value {
    Value::Object(
      self
        .classes
        .iter()
        .map(|(class, t)| {
          (
            class.clone(),
            json!({ "count": t.count, "limit": t.limit, "exceeded": t.exceeded }),
          )
        })
        .collect(),
    )
  }
}

impl fmt::Display for TallyResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.classes.is_empty() {
      return write!(f, "(无)");
    }
    let mut first = true;
    for (class, t) in &self.classes {
      if !first {
        write!(f, ", ")?;
      }
      first = false;
      match t.limit {
        Some(limit) => write!(f, "{} {}/{}", class, t.count, limit)?,
        None => write!(f, "{} {}", class, t.count)?,
      }
      if t.exceeded {
        write!(f, " (超限)")?;
      }
    }
    Ok(())
  }
}

/// 按类别计数并与限额比较
pub fn aggregate(filtered: &[Detection], limits: &ClassLimits) -> TallyResult {
  let counts = filtered
    .iter()
    .fold(BTreeMap::<&str, u32>::new(), |mut counts, d| {
      *counts.entry(d.class.as_str()).or_default() += 1;
      counts
    });

  TallyResult {
    classes: counts
      .into_iter()
      .map(|(class, count)| {
        (
          class.to_string(),
          ClassTally::new(count, limits.limit_for(class)),
        )
      })
      .collect(),
  }
}

/// 白名单与限额的组合配置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PantryRules {
  pub recognized: RecognizedClasses,
  pub limits: ClassLimits,
}

impl PantryRules {
  pub fn new(recognized: RecognizedClasses, limits: ClassLimits) -> Self {
    for (class, _) in limits.iter() {
      if !recognized.contains(class) {
        warn!("类别 '{}' 配置了限额但不在识别列表中，该限额不会生效", class);
      }
    }
    for class in recognized.iter() {
      if limits.limit_for(class).is_none() {
        warn!("类别 '{}' 没有配置限额，视为不限量", class);
      }
    }
    Self { recognized, limits }
  }

  /// 过滤后计数，返回 (过滤后的检测, 计数结果)
  pub fn apply(&self, detections: &[Detection]) -> (Vec<Detection>, TallyResult) {
    let filtered = filter(detections, &self.recognized);
    let tally = aggregate(&filtered, &self.limits);
    (filtered, tally)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  fn det(class: &str) -> Detection {
    Detection::new(class, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
  }

  fn dets(classes: &[&str]) -> Vec<Detection> {
    classes.iter().map(|c| det(c)).collect()
  }

  #[test]
  fn two_bananas_exceed_and_one_carrot_does_not() {
    let limits = ClassLimits::new(["banana=1", "carrot=2"].map(|s| s.parse().unwrap()));
    let tally = aggregate(&dets(&["banana", "banana", "carrot"]), &limits);

    assert_eq!(
      tally.get("banana"),
      Some(&ClassTally {
        count: 2,
        limit: Some(1),
        exceeded: true
      })
    );
    assert_eq!(
      tally.get("carrot"),
      Some(&ClassTally {
        count: 1,
        limit: Some(2),
        exceeded: false
      })
    );
    assert_eq!(tally.len(), 2);
    assert!(tally.any_exceeded());
    assert_eq!(tally.exceeded_classes().collect::<Vec<_>>(), vec!["banana"]);
  }

  #[test]
  fn no_detections_give_an_empty_tally() {
    let tally = aggregate(&[], &ClassLimits::default());
    assert!(tally.is_empty());
    assert!(!tally.any_exceeded());
    assert_eq!(tally.items_summary(), "");
    assert_eq!(tally.to_string(), "(无)");
  }

  #[test]
  fn unrecognized_classes_never_reach_the_tally() {
    let rules = PantryRules::default();
    let (filtered, tally) = rules.apply(&dets(&["laptop", "banana", "laptop"]));
    assert_eq!(filtered, dets(&["banana"]));
    assert!(tally.get("laptop").is_none());
    assert_eq!(tally.count("banana"), 1);
  }

  #[test]
  fn filter_keeps_order_and_is_idempotent() {
    let recognized = RecognizedClasses::default();
    let input = dets(&["donut", "person", "carrot", "laptop", "banana", "donut"]);
    let once = filter(&input, &recognized);
    assert_eq!(once, dets(&["donut", "carrot", "banana", "donut"]));
    assert_eq!(filter(&once, &recognized), once);
    assert!(filter(&dets(&["cup", "tv"]), &recognized).is_empty());
  }

  #[test]
  fn exceeded_is_strictly_greater_than_limit() {
    let limits = ClassLimits::new(["carrot=2".parse().unwrap()]);
    for (count, exceeded) in [(1, false), (2, false), (3, true)] {
      let input = vec![det("carrot"); count];
      let tally = aggregate(&input, &limits);
      assert_eq!(tally.count("carrot"), count as u32);
      assert_eq!(tally.is_exceeded("carrot"), exceeded, "count {}", count);
    }

    let zero = ClassLimits::new(["bottle=0".parse().unwrap()]);
    assert!(aggregate(&dets(&["bottle"]), &zero).is_exceeded("bottle"));
    assert!(!aggregate(&[], &zero).is_exceeded("bottle"));
  }

  #[test]
  fn counts_match_occurrences_for_every_class() {
    let input = dets(&["donut", "bottle", "donut", "broccoli", "donut", "bottle"]);
    let tally = aggregate(&input, &ClassLimits::default());
    for (class, t) in tally.iter() {
      let expected = input.iter().filter(|d| d.class == class).count() as u32;
      assert_eq!(t.count, expected);
      assert_eq!(t.exceeded, t.count > t.limit.unwrap());
    }
    assert_eq!(tally.count("donut"), 3);
  }

  #[test]
  fn missing_limit_means_unlimited() {
    let rules = PantryRules::new(
      RecognizedClasses::new(["apple", "banana"]),
      ClassLimits::default(),
    );
    let (_, tally) = rules.apply(&dets(&["apple"; 10]));
    assert_eq!(
      tally.get("apple"),
      Some(&ClassTally {
        count: 10,
        limit: None,
        exceeded: false
      })
    );
  }

  #[test]
  fn aggregate_is_pure() {
    let input = dets(&["banana", "carrot", "banana"]);
    let limits = ClassLimits::default();
    assert_eq!(aggregate(&input, &limits), aggregate(&input, &limits));
  }

  #[test]
  fn summary_and_json_carry_the_exceeded_item() {
    let tally = aggregate(&dets(&["carrot", "banana", "banana"]), &ClassLimits::default());
    assert_eq!(tally.items_summary(), "banana, banana, carrot");
    assert_eq!(tally.to_string(), "banana 2/1 (超限), carrot 1/2");

    let json = tally.to_json();
    assert_eq!(json["banana"]["count"], 2);
    assert_eq!(json["banana"]["exceeded"], true);
    assert_eq!(json["carrot"]["limit"], 2);
  }

  #[test]
  fn limit_entries_parse_and_reject_garbage() {
    assert_eq!(
      " banana = 3 ".parse::<ClassLimit>(),
      Ok(ClassLimit {
        class: "banana".into(),
        limit: 3
      })
    );
    assert_eq!(
      "banana".parse::<ClassLimit>(),
      Err(RulesError::MalformedLimit("banana".into()))
    );
    assert_eq!("=2".parse::<ClassLimit>(), Err(RulesError::EmptyClass));
    assert!(matches!(
      "banana=-1".parse::<ClassLimit>(),
      Err(RulesError::InvalidLimit(_, _))
    ));
    assert_eq!(ClassLimit::from_str("donut=2").unwrap().to_string(), "donut=2");
  }
}
