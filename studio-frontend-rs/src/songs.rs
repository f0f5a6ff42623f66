use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether::{Entity, HookError, record};

use crate::domain::DomainStore;

pub const ADD_SONG: &str = "addSong";
pub const RENAME_SONG: &str = "renameSong";
pub const REMOVE_SONG: &str = "removeSong";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
}

impl Entity for Song {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Deserialize)]
struct Rename {
    title: String,
}

pub(crate) fn register(songs: &DomainStore<Song>) {
    // variables: the whole song
    songs.register_optimistic(ADD_SONG, |items, _, variables| {
        let song: Song = serde_json::from_value(variables)?;
        items.add_optimistic(&song);
        Ok(())
    });

    // variables: `{ id, title }`
    songs.register_optimistic(RENAME_SONG, |items, id, variables| {
        let Rename { title } = serde_json::from_value(variables)?;
        if title.trim().is_empty() {
            return Err(HookError::from("a song title cannot be blank"));
        }
        items.update_optimistic(id, record(json!({ "title": title })));
        Ok(())
    });

    // variables: `{ id }`
    songs.register_optimistic(REMOVE_SONG, |items, id, _: Value| {
        items.remove_optimistic(id);
        Ok(())
    });
}
