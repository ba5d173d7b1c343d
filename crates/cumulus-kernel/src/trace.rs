//! Operation trace frames.
//!
//! Every traced operation gets an [`OperationFrame`], pushed as a child of
//! the caller's frame when there is one. Frames move through
//! pending → working → {stuck | ready | done}; a frame's *effective* status
//! also looks at its children so a stuck grandchild shows up at the root.
//!
//! Root frames live in the [`TraceService`]'s ongoing registry until their
//! effective status reaches `done`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use uuid::Uuid;

/// Status of an operation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    /// Declared, not yet started.
    Pending,
    /// Running.
    Working,
    /// Never started before its parent finished.
    Stuck,
    /// Own work finished, children still running.
    Ready,
    /// Finished.
    Done,
}

impl FrameStatus {
    pub fn label(&self) -> &'static str {
        match self {
            FrameStatus::Pending => "pending",
            FrameStatus::Working => "working",
            FrameStatus::Stuck => "stuck",
            FrameStatus::Ready => "ready",
            FrameStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
struct FrameState {
    status: FrameStatus,
    effective: FrameStatus,
    tags: Vec<String>,
    attributes: BTreeMap<String, Value>,
    messages: Vec<String>,
    error: Option<String>,
    checkpoint: Option<String>,
    children: Vec<Arc<OperationFrame>>,
    is_async: bool,
}

/// One node in the operation tree.
pub struct OperationFrame {
    id: Uuid,
    label: String,
    parent: Option<Weak<OperationFrame>>,
    registry: Weak<Registry>,
    span: tracing::Span,
    state: Mutex<FrameState>,
}

impl std::fmt::Debug for OperationFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationFrame")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("status", &self.status())
            .finish()
    }
}

impl OperationFrame {
    fn new(label: &str, parent: Option<&Arc<OperationFrame>>, registry: Weak<Registry>) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("frame", id = %id, label = %label);
        Self {
            id,
            label: label.to_string(),
            parent: parent.map(Arc::downgrade),
            registry,
            span,
            state: Mutex::new(FrameState {
                status: FrameStatus::Pending,
                effective: FrameStatus::Pending,
                tags: Vec::new(),
                attributes: BTreeMap::new(),
                messages: Vec::new(),
                error: None,
                checkpoint: None,
                children: Vec::new(),
                is_async: false,
            }),
        }
    }

    // A panic while holding a frame lock leaves plain data behind; keep going.
    fn state(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The span all of this frame's log lines are emitted under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn parent(&self) -> Option<Arc<OperationFrame>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Walk up to the outermost frame.
    pub fn root_frame(self: &Arc<Self>) -> Arc<OperationFrame> {
        let mut frame = Arc::clone(self);
        while let Some(parent) = frame.parent() {
            frame = parent;
        }
        frame
    }

    /// Effective status: accounts for children.
    pub fn status(&self) -> FrameStatus {
        self.state().effective
    }

    /// The status set on this frame itself.
    pub fn own_status(&self) -> FrameStatus {
        self.state().status
    }

    pub fn set_status(&self, status: FrameStatus) {
        self.state().status = status;
        self.recalc_effective();

        let st = self.state();
        let attributes = serde_json::to_string(&st.attributes).unwrap_or_default();
        let _enter = self.span.enter();
        if st.effective != status {
            tracing::info!(
                tags = ?st.tags,
                attributes = %attributes,
                "FRAME STATUS {} (effective: {})",
                status,
                st.effective
            );
        } else {
            tracing::info!(tags = ?st.tags, attributes = %attributes, "FRAME STATUS {}", status);
        }
    }

    fn recalc_effective(&self) {
        let (status, children) = {
            let st = self.state();
            (st.status, st.children.clone())
        };
        let children_done = children.iter().all(|c| c.status() == FrameStatus::Done);

        // A ready frame was only waiting on its children.
        let status = if status == FrameStatus::Ready && children_done {
            self.state().status = FrameStatus::Done;
            tracing::info!(parent: &self.span, "FRAME STATUS done (children finished)");
            FrameStatus::Done
        } else {
            status
        };

        let effective = if children.iter().any(|c| c.status() == FrameStatus::Stuck) {
            FrameStatus::Stuck
        } else if status == FrameStatus::Done && !children_done {
            FrameStatus::Ready
        } else {
            status
        };

        self.state().effective = effective;

        match self.parent() {
            Some(parent) => parent.recalc_effective(),
            None => {
                if effective == FrameStatus::Done {
                    if let Some(registry) = self.registry.upgrade() {
                        registry.unregister(self.id);
                    }
                }
            }
        }
    }

    pub fn done(&self) {
        self.set_status(FrameStatus::Done);
    }

    pub fn tag(&self, tag: impl Into<String>) -> &Self {
        self.state().tags.push(tag.into());
        self
    }

    pub fn tags(&self) -> Vec<String> {
        self.state().tags.clone()
    }

    pub fn attr(&self, key: impl Into<String>, value: impl Into<Value>) -> &Self {
        self.state().attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.state().attributes.clone()
    }

    /// Look up an attribute on this frame, then on each ancestor.
    pub fn get_attr(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.state().attributes.get(key) {
            return Some(v.clone());
        }
        self.parent().and_then(|p| p.get_attr(key))
    }

    pub fn push_message(&self, message: impl Into<String>) -> &Self {
        self.state().messages.push(message.into());
        self
    }

    pub fn messages(&self) -> Vec<String> {
        self.state().messages.clone()
    }

    /// Record an opaque failure.
    pub fn error(&self, err: impl std::fmt::Display) -> &Self {
        self.state().error = Some(err.to_string());
        self
    }

    pub fn error_message(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn checkpoint(&self, name: impl Into<String>) {
        let name = name.into();
        tracing::trace!(parent: &self.span, checkpoint = %name);
        self.state().checkpoint = Some(name);
    }

    pub fn last_checkpoint(&self) -> Option<String> {
        self.state().checkpoint.clone()
    }

    pub fn children(&self) -> Vec<Arc<OperationFrame>> {
        self.state().children.clone()
    }

    /// Whether this frame was still working when its parent finished.
    pub fn is_async(&self) -> bool {
        self.state().is_async
    }

    fn push_child(&self, child: Arc<OperationFrame>) {
        self.state().children.push(child);
        self.recalc_effective();
    }

    /// Sweep children after this frame's own work returns.
    ///
    /// Children still pending are marked stuck. Returns true when any child
    /// is still working.
    pub fn post_run(&self) -> bool {
        let mut any_async = false;
        for child in self.children() {
            if child.status() == FrameStatus::Pending {
                child.set_status(FrameStatus::Stuck);
            }
            if child.status() == FrameStatus::Working {
                child.state().is_async = true;
                any_async = true;
            }
        }
        any_async
    }

    /// One-line summary, or the full subtree when `show_tree` is set.
    pub fn describe(&self, show_tree: bool) -> String {
        self.describe_highlighted(show_tree, None)
    }

    /// Like [`describe`](Self::describe), with one frame of the tree
    /// highlighted in bold cyan.
    pub fn describe_highlighted(&self, show_tree: bool, highlight: Option<Uuid>) -> String {
        let mut s = self.summary();
        if show_tree {
            describe_children(self, "", highlight, &mut s);
        }
        s
    }

    fn summary(&self) -> String {
        let st = self.state();
        let mut s = format!("{} ({})", self.label, st.children.len());
        if !st.tags.is_empty() {
            s.push(' ');
            s.push_str(&st.tags.join(" "));
        }
        if !st.attributes.is_empty() {
            s.push(' ');
            s.push_str(&serde_json::to_string(&st.attributes).unwrap_or_default());
        }
        s
    }
}

fn describe_children(frame: &OperationFrame, prefix: &str, highlight: Option<Uuid>, out: &mut String) {
    let children = frame.children();
    let count = children.len();
    for (i, child) in children.iter().enumerate() {
        let is_last = i + 1 == count;
        let marked = highlight == Some(child.id);
        out.push('\n');
        out.push_str(prefix);
        out.push_str(if is_last { "└─" } else { "├─" });
        if marked {
            out.push_str("\x1B[36;1m");
        }
        out.push_str(&child.summary());
        if marked {
            out.push_str("\x1B[0m");
        }
        let next = format!("{}{}", prefix, if is_last { "  " } else { "│ " });
        describe_children(child, &next, highlight, out);
    }
}

#[derive(Debug, Default)]
struct Registry {
    ongoing: Mutex<HashMap<Uuid, Arc<OperationFrame>>>,
}

impl Registry {
    fn ongoing(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<OperationFrame>>> {
        self.ongoing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, frame: Arc<OperationFrame>) {
        self.ongoing().insert(frame.id, frame);
    }

    fn unregister(&self, id: Uuid) -> Option<Arc<OperationFrame>> {
        self.ongoing().remove(&id)
    }
}

/// Creates frames and tracks root frames that have not finished.
#[derive(Debug, Clone, Default)]
pub struct TraceService {
    registry: Arc<Registry>,
}

impl TraceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame, as a child of `parent` when given.
    ///
    /// Root frames are registered as ongoing.
    pub fn add_frame(&self, label: &str, parent: Option<&Arc<OperationFrame>>) -> Arc<OperationFrame> {
        let frame = Arc::new(OperationFrame::new(label, parent, Arc::downgrade(&self.registry)));
        match parent {
            Some(parent) => parent.push_child(Arc::clone(&frame)),
            None => self.register(Arc::clone(&frame)),
        }
        tracing::info!(parent: frame.span(), "FRAME START {}", frame.describe(false));
        frame
    }

    pub fn register(&self, frame: Arc<OperationFrame>) {
        self.registry.register(frame);
    }

    pub fn unregister(&self, id: Uuid) -> Option<Arc<OperationFrame>> {
        self.registry.unregister(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<OperationFrame>> {
        self.registry.ongoing().get(&id).cloned()
    }

    /// Root frames that have not reached effective `done`.
    pub fn ongoing(&self) -> Vec<Arc<OperationFrame>> {
        self.registry.ongoing().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_child_makes_parent_stuck() {
        let trace = TraceService::new();
        let root = trace.add_frame("root", None);
        root.set_status(FrameStatus::Working);
        let child = trace.add_frame("child", Some(&root));

        assert!(!root.post_run());
        root.set_status(FrameStatus::Done);

        assert_eq!(child.status(), FrameStatus::Stuck);
        assert_eq!(root.own_status(), FrameStatus::Done);
        assert_eq!(root.status(), FrameStatus::Stuck);
        assert_eq!(trace.ongoing().len(), 1);
    }

    #[test]
    fn stuck_propagates_through_depth() {
        let trace = TraceService::new();
        let root = trace.add_frame("root", None);
        let mid = trace.add_frame("mid", Some(&root));
        let leaf = trace.add_frame("leaf", Some(&mid));
        leaf.set_status(FrameStatus::Stuck);
        assert_eq!(mid.status(), FrameStatus::Stuck);
        assert_eq!(root.status(), FrameStatus::Stuck);
    }

    #[test]
    fn done_with_working_child_reads_ready() {
        let trace = TraceService::new();
        let root = trace.add_frame("root", None);
        let child = trace.add_frame("child", Some(&root));
        child.set_status(FrameStatus::Working);

        assert!(root.post_run());
        assert!(child.is_async());
        root.set_status(FrameStatus::Done);
        assert_eq!(root.status(), FrameStatus::Ready);
        assert_eq!(trace.ongoing().len(), 1);

        child.set_status(FrameStatus::Done);
        assert_eq!(root.status(), FrameStatus::Done);
        assert!(trace.ongoing().is_empty());
    }

    #[test]
    fn ready_root_finishes_when_its_late_child_does() {
        let trace = TraceService::new();
        let root = trace.add_frame("root", None);
        root.set_status(FrameStatus::Working);
        let child = trace.add_frame("child", Some(&root));
        child.set_status(FrameStatus::Working);

        assert!(root.post_run());
        root.set_status(FrameStatus::Ready);
        assert_eq!(trace.ongoing().len(), 1);

        child.set_status(FrameStatus::Done);
        assert_eq!(root.own_status(), FrameStatus::Done);
        assert_eq!(root.status(), FrameStatus::Done);
        assert!(trace.ongoing().is_empty());
    }

    #[test]
    fn get_attr_walks_up() {
        let trace = TraceService::new();
        let root = trace.add_frame("root", None);
        root.attr("actor", "user:alice");
        let child = trace.add_frame("child", Some(&root));
        child.attr("target-uid", "abc");
        assert_eq!(child.get_attr("actor"), Some(Value::from("user:alice")));
        assert_eq!(child.get_attr("target-uid"), Some(Value::from("abc")));
        assert!(root.get_attr("target-uid").is_none());
    }

    #[test]
    fn describe_draws_tree() {
        let trace = TraceService::new();
        let root = trace.add_frame("copy", None);
        let a = trace.add_frame("stat", Some(&root));
        trace.add_frame("read", Some(&a));
        trace.add_frame("write", Some(&root));

        let text = root.describe(true);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "copy (2)");
        assert_eq!(lines[1], "├─stat (1)");
        assert_eq!(lines[2], "│ └─read (0)");
        assert_eq!(lines[3], "└─write (0)");
        assert_eq!(root.describe(false), "copy (2)");
    }
}
