use crate::core::task::SchedulableTask;
use crate::runtime::builder::{ARG_LIST, CONTEXT, LAUNCH, LOAD_PRIM, LOAD_REF};
use crate::runtime::context::{ExecutionContext, VariableSlot};

/// Writes the invocation stream consumed by
/// [`GraphBuilder`](crate::runtime::builder::GraphBuilder).
#[derive(Debug, Clone, Default)]
pub struct InvocationRecorder {
    buffer: Vec<u8>,
}

impl InvocationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn operand(&mut self, value: usize) {
        let value = i32::try_from(value).unwrap_or_else(|_| panic!("stream operand {value} does not fit in i32"));
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn context(&mut self, gtid: usize, task: usize) {
        self.buffer.push(CONTEXT);
        self.operand(gtid);
        self.operand(task);
    }

    pub fn arg_list(&mut self, size: usize) {
        self.buffer.push(ARG_LIST);
        self.operand(size);
    }

    pub fn load_ref(&mut self, object: usize) {
        self.buffer.push(LOAD_REF);
        self.operand(object);
    }

    pub fn load_prim(&mut self, constant: usize) {
        self.buffer.push(LOAD_PRIM);
        self.operand(constant);
    }

    pub fn launch(&mut self) {
        self.buffer.push(LAUNCH);
    }

    /// Registers `task` and its arguments in `ctx` and records one
    /// invocation of it. Returns the invocation's global task id.
    pub fn record(&mut self, ctx: &mut ExecutionContext, task: SchedulableTask) -> usize {
        let slots: Vec<VariableSlot> = task.args().iter().map(|arg| ctx.insert_variable(arg)).collect();
        let index = ctx.add_task(task);
        let gtid = ctx.next_global_task_id();

        self.context(gtid, index);
        self.arg_list(slots.len());
        for slot in slots {
            match slot {
                VariableSlot::Constant(c) => self.load_prim(c),
                VariableSlot::Object(o) => self.load_ref(o),
            }
        }
        self.launch();
        gtid
    }
}
