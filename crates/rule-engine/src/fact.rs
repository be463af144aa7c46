//! 工作集
//!
//! 一次执行内可见的全部事实（输入 + INSERT 产生），以固定下标的槽位数组保存。
//! 撤回的事实保留槽位但不再参与匹配，下标在整次执行中保持稳定。

use serde_json::Value;

/// 工作集中事实的稳定句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactHandle(usize);

impl FactHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// 事实来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactOrigin {
    Input,
    Inserted { rule_id: String },
}

/// 带类型的事实
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    /// 事实对应的 Schema 名称
    pub fact_type: String,
    pub data: Value,
}

impl Fact {
    pub fn new(fact_type: impl Into<String>, data: Value) -> Self {
        Self {
            fact_type: fact_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    fact: Fact,
    origin: FactOrigin,
    /// 每次 MODIFY 后递增
    version: u64,
    retracted: bool,
}

/// 工作集
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    slots: Vec<Slot>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由输入事实构建工作集
    pub fn from_inputs(fact_type: &str, facts: &[Value]) -> Self {
        let mut set = Self::new();
        for data in facts {
            set.push(Fact::new(fact_type, data.clone()), FactOrigin::Input);
        }
        set
    }

    pub fn insert(&mut self, fact: Fact, rule_id: &str) -> FactHandle {
        self.push(
            fact,
            FactOrigin::Inserted {
                rule_id: rule_id.to_string(),
            },
        )
    }

    fn push(&mut self, fact: Fact, origin: FactOrigin) -> FactHandle {
        self.slots.push(Slot {
            fact,
            origin,
            version: 0,
            retracted: false,
        });
        FactHandle(self.slots.len() - 1)
    }

    /// 获取存活事实
    pub fn get(&self, handle: FactHandle) -> Option<&Fact> {
        self.slots
            .get(handle.0)
            .filter(|s| !s.retracted)
            .map(|s| &s.fact)
    }

    /// 可变访问存活事实的数据，调用即视为一次修改
    pub fn data_mut(&mut self, handle: FactHandle) -> Option<&mut Value> {
        let slot = self.slots.get_mut(handle.0).filter(|s| !s.retracted)?;
        slot.version += 1;
        Some(&mut slot.fact.data)
    }

    pub fn version(&self, handle: FactHandle) -> u64 {
        self.slots.get(handle.0).map(|s| s.version).unwrap_or(0)
    }

    pub fn origin(&self, handle: FactHandle) -> Option<&FactOrigin> {
        self.slots.get(handle.0).map(|s| &s.origin)
    }

    pub fn is_live(&self, handle: FactHandle) -> bool {
        self.slots.get(handle.0).is_some_and(|s| !s.retracted)
    }

    /// 撤回事实，返回是否确实移除
    pub fn retract(&mut self, handle: FactHandle) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot) if !slot.retracted => {
                slot.retracted = true;
                true
            }
            _ => false,
        }
    }

    /// 当前所有存活事实的句柄快照（按插入顺序）
    pub fn live_handles(&self) -> Vec<FactHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.retracted)
            .map(|(i, _)| FactHandle(i))
            .collect()
    }

    /// 指定类型的存活事实
    pub fn live_of_type(&self, fact_type: &str) -> Vec<FactHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.retracted && s.fact.fact_type == fact_type)
            .map(|(i, _)| FactHandle(i))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.retracted).count()
    }

    /// 槽位总数（包括已撤回）
    pub fn capacity_used(&self) -> usize {
        self.slots.len()
    }

    /// 最终工作集的数据（按插入顺序，不含已撤回事实）
    pub fn into_result_facts(self) -> Vec<Value> {
        self.slots
            .into_iter()
            .filter(|s| !s.retracted)
            .map(|s| s.fact.data)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handles_stay_stable_after_retract() {
        let mut set = WorkingSet::from_inputs("Order", &[json!({"id": 1}), json!({"id": 2})]);
        let first = set.live_handles()[0];
        let second = set.live_handles()[1];

        assert!(set.retract(first));
        assert!(!set.retract(first));
        assert!(set.get(first).is_none());
        assert_eq!(set.get(second).unwrap().data, json!({"id": 2}));

        let inserted = set.insert(Fact::new("Alert", json!({"level": "HIGH"})), "r1");
        assert_eq!(inserted.index(), 2);
        assert_eq!(set.live_count(), 2);
        assert_eq!(set.capacity_used(), 3);
        assert_eq!(
            set.origin(inserted),
            Some(&FactOrigin::Inserted {
                rule_id: "r1".to_string()
            })
        );
    }

    #[test]
    fn test_version_increments_on_mutation() {
        let mut set = WorkingSet::from_inputs("Order", &[json!({"status": "OK"})]);
        let handle = set.live_handles()[0];
        assert_eq!(set.version(handle), 0);

        if let Some(data) = set.data_mut(handle) {
            data["status"] = json!("FLAGGED");
        }
        assert_eq!(set.version(handle), 1);
        assert_eq!(set.get(handle).unwrap().data["status"], "FLAGGED");
    }

    #[test]
    fn test_live_of_type_and_results() {
        let mut set = WorkingSet::from_inputs("Order", &[json!({"id": 1})]);
        set.insert(Fact::new("Alert", json!({"id": 9})), "r1");

        assert_eq!(set.live_of_type("Alert").len(), 1);
        assert_eq!(set.live_of_type("Order").len(), 1);
        assert_eq!(
            set.into_result_facts(),
            vec![json!({"id": 1}), json!({"id": 9})]
        );
    }
}
