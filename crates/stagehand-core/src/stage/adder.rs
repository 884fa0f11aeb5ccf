//! AddTaskHandle - stage が自分の種別のタスク行を挿入するためのハンドル

use std::sync::Arc;

use tracing::debug;

use crate::domain::{
    InsertOutcome, NewTask, PipelineKey, Resources, StageDetails, TaskId, TaskTypeName,
};
use crate::ports::{Clock, IdGenerator, StoreError, TaskStore};

/// AddTaskHandle は `Stage::on_register` に渡される挿入ハンドル
///
/// - 行は常に登録した stage のもので、cost は登録時のスナップショット
/// - 前段を持つ stage は、前段の行がすべて Done のパイプラインにしか追加できない
///   （store が挿入と同じクリティカルセクションで確認する）
#[derive(Clone)]
pub struct AddTaskHandle {
    stage: TaskTypeName,
    cost: Resources,
    follows: Vec<TaskTypeName>,
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl AddTaskHandle {
    pub(crate) fn new(
        details: &StageDetails,
        store: Arc<dyn TaskStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stage: details.name.clone(),
            cost: details.cost,
            follows: details.follows.clone(),
            store,
            ids,
            clock,
        }
    }

    pub fn stage(&self) -> &TaskTypeName {
        &self.stage
    }

    /// 1 行挿入する。pipeline キー付きなら (pipeline, stage) で冪等、
    /// 2 回目は `AlreadyExists`
    pub async fn add(
        &self,
        pipeline: Option<PipelineKey>,
        depends_on: Vec<TaskId>,
        payload: serde_json::Value,
    ) -> Result<InsertOutcome, StoreError> {
        let mut new = NewTask::new(self.stage.clone(), self.cost)
            .following(self.follows.clone())
            .depending_on(depends_on)
            .with_payload(payload);
        if let Some(key) = pipeline {
            new = new.for_pipeline(key);
        }
        let outcome = self
            .store
            .insert_task(self.ids.generate_task_id(), new, self.clock.now())
            .await?;
        debug!(stage = %self.stage, task_id = %outcome.task_id(), inserted = outcome.is_inserted(), "task added");
        Ok(outcome)
    }
}

impl std::fmt::Debug for AddTaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddTaskHandle")
            .field("stage", &self.stage)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{SystemClock, UlidGenerator};

    fn handle_for(details: StageDetails, store: Arc<InMemoryTaskStore>) -> AddTaskHandle {
        AddTaskHandle::new(
            &details,
            store,
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
        )
    }

    fn handle(store: Arc<InMemoryTaskStore>) -> AddTaskHandle {
        handle_for(
            StageDetails::new("WdPost").with_cost(Resources::new(2, 1, 4000)),
            store,
        )
    }

    #[tokio::test]
    async fn standalone_rows_carry_the_stage_cost() {
        let store = Arc::new(InMemoryTaskStore::new());
        let adder = handle(store.clone());

        let outcome = adder
            .add(None, Vec::new(), serde_json::json!({"deadline": 12}))
            .await
            .unwrap();
        assert!(outcome.is_inserted());

        let row = store.get_task(outcome.task_id()).await.unwrap().unwrap();
        assert_eq!(row.task_type.as_str(), "WdPost");
        assert_eq!(row.cost, Resources::new(2, 1, 4000));
        assert_eq!(row.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn pipeline_rows_are_idempotent() {
        let store = Arc::new(InMemoryTaskStore::new());
        let key = PipelineKey::new("f01000-1");
        store
            .register_pipeline(key.clone(), serde_json::Value::Null, SystemClock.now())
            .await
            .unwrap();
        let adder = handle(store.clone());

        let first = adder.add(Some(key.clone()), Vec::new(), serde_json::Value::Null).await.unwrap();
        let second = adder.add(Some(key), Vec::new(), serde_json::Value::Null).await.unwrap();
        assert!(first.is_inserted());
        assert_eq!(second, InsertOutcome::AlreadyExists(first.task_id()));
    }

    #[tokio::test]
    async fn successor_rows_wait_for_their_predecessors() {
        let store = Arc::new(InMemoryTaskStore::new());
        let key = PipelineKey::new("s1");
        store
            .register_pipeline(key.clone(), serde_json::Value::Null, SystemClock.now())
            .await
            .unwrap();
        let adder = handle_for(StageDetails::new("SDRTrees").following(["PreCommit2"]), store.clone());

        let err = adder.add(Some(key), Vec::new(), serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, StoreError::PredecessorsNotDone { .. }));

        let err = adder.add(None, Vec::new(), serde_json::Value::Null).await.unwrap_err();
        assert_eq!(err, StoreError::PipelineRequired(TaskTypeName::new("SDRTrees")));
        assert_eq!(store.counts_by_state().await.unwrap().total(), 0);
    }
}
