use crate::error::MattingResult;
use ndarray::{concatenate, Array1, Array2, Array3, Array4, Axis};
use std::collections::VecDeque;

/// Encoded memory of one tracked frame
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    /// Shape [1, mem_dim, h, w]
    pub features: Array4<f32>,
    /// Shape [h * w, 1, mem_dim]
    pub pos_enc: Array3<f32>,
}

/// Inputs assembled for one memory-attention call
#[derive(Debug)]
pub struct MemoryInputs {
    /// Object pointers, shape [K, hidden]
    pub pointers: Array2<f32>,
    /// Normalized temporal distance of every pointer, shape [K]
    pub pointer_tpos: Array1<f32>,
    /// Stacked mask memories, shape [N, mem_dim, h, w]
    pub memories: Array4<f32>,
    /// Positional encoding of every memory token, shape [N * h * w, 1, mem_dim]
    pub memory_pos: Array3<f32>,
}

/// Propagation memory for a single track
///
/// Frame offsets are relative to the prompt frame, which is offset 0 and is
/// never evicted. Propagated frames keep only the most recent memories and
/// object pointers the model can attend to.
pub struct TrackState {
    memory_slots: usize,
    max_pointers: usize,
    /// Temporal slot encodings, shape [memory_slots, 1, 1, mem_dim]
    temporal_code: Array4<f32>,
    prompt_memory: MemoryEntry,
    prompt_pointer: Array1<f32>,
    recent_memories: VecDeque<(usize, MemoryEntry)>,
    recent_pointers: VecDeque<(usize, Array1<f32>)>,
    offset: usize,
}

impl TrackState {
    pub fn new(
        memory_slots: usize,
        max_pointers: usize,
        temporal_code: Array4<f32>,
        prompt_memory: MemoryEntry,
        prompt_pointer: Array1<f32>,
    ) -> Self {
        Self {
            memory_slots,
            max_pointers,
            temporal_code,
            prompt_memory,
            prompt_pointer,
            recent_memories: VecDeque::with_capacity(memory_slots),
            recent_pointers: VecDeque::with_capacity(max_pointers),
            offset: 0,
        }
    }

    /// Offset of the most recently tracked frame
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Gather memories and pointers visible to the frame after the current one
    pub fn memory_inputs(&self) -> MattingResult<MemoryInputs> {
        let target = self.offset + 1;

        // (temporal position, memory); position 0 is the prompt frame
        let mut selected: Vec<(usize, &MemoryEntry)> = vec![(0, &self.prompt_memory)];
        for t_pos in 1..self.memory_slots {
            let distance = self.memory_slots - t_pos;
            let Some(prev) = target.checked_sub(distance).filter(|&p| p >= 1) else {
                continue;
            };
            if let Some((_, entry)) = self.recent_memories.iter().find(|(o, _)| *o == prev) {
                selected.push((t_pos, entry));
            }
        }

        let feature_views: Vec<_> = selected.iter().map(|(_, m)| m.features.view()).collect();
        let memories = concatenate(Axis(0), &feature_views)?;

        let pos_parts: Vec<Array3<f32>> = selected
            .iter()
            .map(|(t_pos, m)| {
                let slot = self.memory_slots - t_pos - 1;
                let code = self.temporal_code.index_axis(Axis(0), slot);
                &m.pos_enc + &code
            })
            .collect();
        let pos_views: Vec<_> = pos_parts.iter().map(|p| p.view()).collect();
        let memory_pos = concatenate(Axis(0), &pos_views)?;

        let mut pointers = vec![(target, &self.prompt_pointer)];
        for t_diff in 1..self.max_pointers {
            let Some(prev) = target.checked_sub(t_diff).filter(|&p| p >= 1) else {
                break;
            };
            if let Some((_, ptr)) = self.recent_pointers.iter().find(|(o, _)| *o == prev) {
                pointers.push((t_diff, ptr));
            }
        }

        let tpos_scale = self.max_pointers.saturating_sub(1).max(1) as f32;
        let pointer_tpos = pointers
            .iter()
            .map(|(t_diff, _)| *t_diff as f32 / tpos_scale)
            .collect::<Array1<f32>>();
        let pointer_views: Vec<_> = pointers
            .iter()
            .map(|(_, p)| p.view().insert_axis(Axis(0)))
            .collect();
        let pointers = concatenate(Axis(0), &pointer_views)?;

        Ok(MemoryInputs {
            pointers,
            pointer_tpos,
            memories,
            memory_pos,
        })
    }

    /// Record the memory of the next frame and advance the offset
    pub fn push(&mut self, memory: MemoryEntry, pointer: Array1<f32>) {
        self.offset += 1;

        self.recent_memories.push_back((self.offset, memory));
        while self.recent_memories.len() > self.memory_slots.saturating_sub(1) {
            self.recent_memories.pop_front();
        }

        self.recent_pointers.push_back((self.offset, pointer));
        while self.recent_pointers.len() > self.max_pointers.saturating_sub(1) {
            self.recent_pointers.pop_front();
        }
    }

    #[cfg(test)]
    pub fn retained_memories(&self) -> usize {
        1 + self.recent_memories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEM_DIM: usize = 2;
    const SLOTS: usize = 3;

    fn entry(value: f32) -> MemoryEntry {
        MemoryEntry {
            features: Array4::from_elem((1, MEM_DIM, 2, 2), value),
            pos_enc: Array3::zeros((4, 1, MEM_DIM)),
        }
    }

    fn state(max_pointers: usize) -> TrackState {
        let temporal_code =
            Array4::from_shape_fn((SLOTS, 1, 1, MEM_DIM), |(slot, _, _, _)| slot as f32 * 10.0);
        TrackState::new(
            SLOTS,
            max_pointers,
            temporal_code,
            entry(0.0),
            Array1::from_elem(4, 0.0),
        )
    }

    #[test]
    fn first_propagation_sees_only_the_prompt_frame() {
        let state = state(4);
        let inputs = state.memory_inputs().unwrap();

        assert_eq!(inputs.memories.dim(), (1, MEM_DIM, 2, 2));
        assert_eq!(inputs.pointers.dim(), (1, 4));
        // prompt memory sits in the oldest temporal slot
        assert!(inputs.memory_pos.iter().all(|&v| v == 20.0));
        assert_eq!(inputs.pointer_tpos[0], 1.0 / 3.0);
    }

    #[test]
    fn keeps_prompt_plus_most_recent_memories() {
        let mut state = state(4);
        for i in 1..=5 {
            state.push(entry(i as f32), Array1::from_elem(4, i as f32));
        }
        assert_eq!(state.offset(), 5);
        assert_eq!(state.retained_memories(), SLOTS);

        let inputs = state.memory_inputs().unwrap();
        // prompt (offset 0), then offsets 4 and 5 in temporal order
        let firsts: Vec<f32> = inputs
            .memories
            .axis_iter(Axis(0))
            .map(|m| m[[0, 0, 0]])
            .collect();
        assert_eq!(firsts, vec![0.0, 4.0, 5.0]);

        // pointers: prompt plus offsets 5, 4, 3
        let pointer_values: Vec<f32> = inputs.pointers.column(0).to_vec();
        assert_eq!(pointer_values, vec![0.0, 5.0, 4.0, 3.0]);
        assert_eq!(inputs.pointer_tpos.to_vec(), vec![2.0, 1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }
}
