use rand::seq::SliceRandom;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use super::item::PlayableItem;
use crate::error::{PlayerError, PlayerResult};

/// Pending items for one guild.
///
/// No locking of its own: the owning `PlaybackController` only touches it
/// while holding the session guard. The currently playing item never lives
/// here.
#[derive(Debug)]
pub struct SessionQueue {
    items: VecDeque<PlayableItem>,
    max_size: usize,
}

impl SessionQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un item al final de la cola y devuelve su posición (1-based)
    pub fn append(&mut self, item: PlayableItem) -> PlayerResult<usize> {
        if self.items.len() >= self.max_size {
            return Err(PlayerError::QueueFull { max: self.max_size });
        }

        info!("➕ Agregado a la cola: {}", item.title());
        self.items.push_back(item);
        Ok(self.items.len())
    }

    /// Agrega varios items (playlist) hasta llenar la cola
    pub fn append_many(&mut self, items: Vec<PlayableItem>) -> usize {
        let available_space = self.max_size.saturating_sub(self.items.len());
        let to_add = items.len().min(available_space);

        self.items.extend(items.into_iter().take(to_add));

        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    /// Siguiente item en orden FIFO
    pub fn pop_front(&mut self) -> Option<PlayableItem> {
        let next = self.items.pop_front();
        if let Some(ref item) = next {
            debug!("➡️ Siguiente en cola (FIFO): {}", item.title());
        }
        next
    }

    pub fn remove_at(&mut self, index: usize) -> PlayerResult<PlayableItem> {
        let len = self.items.len();
        let removed = self
            .items
            .remove(index)
            .ok_or(PlayerError::OutOfRange { index, len })?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(removed)
    }

    /// Devuelve al frente un item recién sacado con `pop_front`. No mira el
    /// límite: ese lugar lo ocupaba el propio item.
    pub fn push_front(&mut self, item: PlayableItem) {
        self.items.push_front(item);
    }

    /// Mueve un item a una nueva posición; ambos índices deben existir
    pub fn move_to(&mut self, from: usize, to: usize) -> PlayerResult<()> {
        let len = self.items.len();
        if from >= len {
            return Err(PlayerError::OutOfRange { index: from, len });
        }
        if to >= len {
            return Err(PlayerError::OutOfRange { index: to, len });
        }

        if from != to {
            if let Some(item) = self.items.remove(from) {
                self.items.insert(to, item);
            }
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Read-only copy for display.
    pub fn peek_all(&self) -> Vec<PlayableItem> {
        self.items.iter().cloned().collect()
    }

    /// Mezcla la cola; devuelve cuántos items había
    pub fn shuffle(&mut self) -> usize {
        let count = self.items.len();
        if count > 1 {
            let mut rng = rand::thread_rng();
            self.items.make_contiguous().shuffle(&mut rng);
            info!("🔀 Cola mezclada ({} canciones)", count);
        }
        count
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        if cleared > 0 {
            info!("🗑️ Cola limpiada: {} tracks removidos", cleared);
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().filter_map(|item| item.duration()).sum()
    }
}

/// Una página de la cola para mostrar en un embed
#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<PlayableItem>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl QueuePage {
    /// Corta una página (1-based) de un snapshot de la cola
    pub fn from_items(items: &[PlayableItem], page: usize, items_per_page: usize) -> Self {
        let items_per_page = items_per_page.max(1);
        let total_items = items.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let safe_page = page.clamp(1, total_pages);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(total_items);

        Self {
            items: items.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            current_page: safe_page,
            total_pages,
            total_items,
        }
    }
}
