use crate::editor::{BufferId, Editor};
use anyhow::Result;
use gdb_mi::{BreakpointLocation, ProgramCounter};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

pub type SignKey = (BufferId, u32);

const BREAKPOINT_SIGN: &str = "gdb_bp";
/// A breakpoint on a line that also holds a program counter.
const BREAKPOINT_AT_PC_SIGN: &str = "gdb_bp_pc";
const PC_SELECTED_SIGN: &str = "gdb_pc_selected";
const PC_UNSELECTED_SIGN: &str = "gdb_pc_unselected";

#[derive(Clone, Debug, PartialEq, Eq)]
struct Sign {
    id: u32,
    name: &'static str,
}

/// What a breakpoint reconciliation changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BreakpointDiff {
    pub hidden: Vec<SignKey>,
    pub created: Vec<SignKey>,
}

/// Tracks the signs currently shown in source buffers and updates them with
/// as few place/unplace operations as possible.
#[derive(Debug)]
pub struct SignReconciler {
    next_id: u32,
    bp_signs: BTreeMap<SignKey, Sign>,
    bp_numbers: BTreeMap<SignKey, String>,
    pc_signs: BTreeMap<SignKey, Sign>,
    pc_cur_loc: Option<SignKey>,
}

impl Default for SignReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignReconciler {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            bp_signs: BTreeMap::new(),
            bp_numbers: BTreeMap::new(),
            pc_signs: BTreeMap::new(),
            pc_cur_loc: None,
        }
    }

    pub fn breakpoint_keys(&self) -> Vec<SignKey> {
        self.bp_signs.keys().copied().collect()
    }

    pub fn pc_keys(&self) -> Vec<SignKey> {
        self.pc_signs.keys().copied().collect()
    }

    /// Number of the breakpoint shown at `key`, if any.
    pub fn breakpoint_at(&self, key: SignKey) -> Option<&str> {
        self.bp_numbers.get(&key).map(String::as_str)
    }

    fn place<E: Editor>(
        &mut self,
        editor: &mut E,
        name: &'static str,
        key: SignKey,
    ) -> Result<Sign> {
        let id = self.next_id;
        self.next_id += 1;
        editor.sign_place(id, name, key.0, key.1)?;
        Ok(Sign { id, name })
    }

    /// Replaces every program counter sign. Jumps to the selected location
    /// once, and only if it moved since the last call.
    pub async fn reconcile_pc<E: Editor>(
        &mut self,
        editor: &mut E,
        counters: &[ProgramCounter],
    ) -> Result<()> {
        for sign in std::mem::take(&mut self.pc_signs).into_values() {
            editor.sign_unplace(sign.id)?;
        }

        let mut selected = None;
        for counter in counters {
            log::debug!("program counter at {}:{}", counter.path, counter.line);
            let Some(buffer) = resolve_buffer(editor, &counter.path).await? else {
                continue;
            };
            let key = (buffer, counter.line);
            if let Some(existing) = self.pc_signs.get(&key) {
                if !counter.is_selected {
                    continue;
                }
                editor.sign_unplace(existing.id)?;
            }

            let name = if counter.is_selected {
                PC_SELECTED_SIGN
            } else {
                PC_UNSELECTED_SIGN
            };
            let sign = self.place(editor, name, key)?;
            if counter.is_selected {
                selected = Some((key, sign.id));
            }
            self.pc_signs.insert(key, sign);
        }

        let selected_key = selected.map(|(key, _)| key);
        if let Some((key, id)) = selected {
            if self.pc_cur_loc != Some(key) {
                editor.sign_jump(key.0, id)?;
            }
        }
        self.pc_cur_loc = selected_key;
        Ok(())
    }

    /// Brings breakpoint signs in line with `locations`. Unchanged signs are
    /// left alone unless `hard_update` is set, in which case every sign is
    /// recreated.
    pub async fn reconcile_breakpoints<E: Editor>(
        &mut self,
        editor: &mut E,
        locations: &[BreakpointLocation],
        hard_update: bool,
    ) -> Result<BreakpointDiff> {
        let mut wanted = BTreeMap::new();
        for location in locations {
            if let Some(buffer) = resolve_buffer(editor, &location.path).await? {
                wanted
                    .entry((buffer, location.line))
                    .or_insert_with(|| location.number.clone());
            }
        }

        let mut diff = BreakpointDiff::default();
        let mut kept = BTreeSet::new();
        for (key, sign) in std::mem::take(&mut self.bp_signs) {
            let unchanged = wanted.contains_key(&key) && sign.name == self.breakpoint_sign(key);
            if unchanged && !hard_update {
                kept.insert(key);
                self.bp_signs.insert(key, sign);
            } else {
                editor.sign_unplace(sign.id)?;
                diff.hidden.push(key);
            }
        }

        for key in wanted.keys() {
            if !kept.contains(key) {
                let name = self.breakpoint_sign(*key);
                let sign = self.place(editor, name, *key)?;
                self.bp_signs.insert(*key, sign);
                diff.created.push(*key);
            }
        }
        self.bp_numbers = wanted;
        Ok(diff)
    }

    fn breakpoint_sign(&self, key: SignKey) -> &'static str {
        if self.pc_signs.contains_key(&key) {
            BREAKPOINT_AT_PC_SIGN
        } else {
            BREAKPOINT_SIGN
        }
    }
}

/// Buffer for a source file reported by the debugger. Files that do not
/// exist locally have no buffer.
async fn resolve_buffer<E: Editor>(editor: &mut E, path: &str) -> Result<Option<BufferId>> {
    if path.is_empty() || !Path::new(path).exists() {
        return Ok(None);
    }
    editor.buffer_add(path).await.map(Some)
}
