//! Single request manager: drives a branch of a change with no relation
//! chain. The pick is based directly on the target branch's head.

use crate::engine::signal::{Signal, Step};
use crate::engine::Core;
use crate::processor::{steps, StepError};
use crate::types::{Branch, ProcessingRecord};

pub(crate) async fn start(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
) -> Result<(), StepError> {
    let Some(head) = steps::validated_branch_head(core, record, branch).await? else {
        return Ok(());
    };
    core.send(Signal::new(
        record.run_id,
        Step::CreatePick {
            branch: branch.clone(),
            parent: head,
        },
    ));
    Ok(())
}
