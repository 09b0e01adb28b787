//! Sticker and custom-emoji sets as a [`PackPublisher`].

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{InputFile, InputSticker, Sticker, StickerFormat, StickerType},
    ApiError, RequestError,
};
use tracing::debug;

use stk_core::{
    config::PackKind,
    domain::UserId,
    ports::{
        Container, ContainerSpec, InputItem, ItemFormat, ItemUpload, PackPublisher,
        PublishedItem, UploadedItem,
    },
    Result,
};

use crate::{map_err, tg_user, with_retry};

#[derive(Clone)]
pub struct TelegramPackPublisher {
    bot: Bot,
    kind: PackKind,
}

impl TelegramPackPublisher {
    pub fn new(bot: Bot, kind: PackKind) -> Self {
        Self { bot, kind }
    }
}

fn sticker_format(format: ItemFormat) -> StickerFormat {
    match format {
        ItemFormat::Static => StickerFormat::Static,
        ItemFormat::Animated => StickerFormat::Animated,
        ItemFormat::Video => StickerFormat::Video,
    }
}

fn sticker_type(kind: PackKind) -> StickerType {
    match kind {
        PackKind::CustomEmoji => StickerType::CustomEmoji,
        PackKind::Sticker => StickerType::Regular,
    }
}

fn input_sticker(item: InputItem) -> InputSticker {
    InputSticker {
        sticker: InputFile::file_id(item.file_id),
        emoji_list: vec![item.emoji],
        mask_position: None,
        keywords: Vec::new(),
    }
}

/// Stable reference of a set member: the custom emoji id for emoji sets,
/// the file id otherwise.
fn sticker_reference(kind: PackKind, sticker: &Sticker) -> String {
    let emoji_id = match kind {
        PackKind::CustomEmoji => custom_emoji_id(sticker),
        PackKind::Sticker => None,
    };
    emoji_id.unwrap_or_else(|| sticker.file.id.clone())
}

fn custom_emoji_id(sticker: &Sticker) -> Option<String> {
    // Read from the wire form so the accessor type does not matter.
    let value = serde_json::to_value(sticker).ok()?;
    value.get("custom_emoji_id")?.as_str().map(str::to_string)
}

#[async_trait]
impl PackPublisher for TelegramPackPublisher {
    async fn upload_item(&self, owner: UserId, item: &ItemUpload) -> Result<UploadedItem> {
        let format = sticker_format(item.format);
        let file = with_retry(|| {
            let input = InputFile::memory(item.data.clone()).file_name(item.file_name.clone());
            self.bot.upload_sticker_file(tg_user(owner), input, format.clone())
        })
        .await?;
        Ok(UploadedItem {
            file_id: file.id.clone(),
        })
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<()> {
        // All items of one set share the format of the first.
        let format = spec
            .items
            .first()
            .map(|i| sticker_format(i.format))
            .unwrap_or(StickerFormat::Video);
        let stickers: Vec<InputSticker> = spec.items.into_iter().map(input_sticker).collect();
        debug!(link = %spec.link, items = stickers.len(), "creating sticker set");

        with_retry(|| {
            self.bot
                .create_new_sticker_set(
                    tg_user(spec.owner),
                    spec.link.clone(),
                    spec.title.clone(),
                    stickers.clone(),
                    format.clone(),
                )
                .sticker_type(sticker_type(spec.kind))
        })
        .await?;
        Ok(())
    }

    async fn append_items(&self, owner: UserId, link: &str, items: Vec<InputItem>) -> Result<()> {
        for item in items {
            let sticker = input_sticker(item);
            with_retry(|| {
                self.bot
                    .add_sticker_to_set(tg_user(owner), link.to_string(), sticker.clone())
            })
            .await?;
        }
        Ok(())
    }

    async fn get_container(&self, link: &str) -> Result<Option<Container>> {
        let set = match self.bot.get_sticker_set(link.to_string()).await {
            Ok(set) => set,
            Err(RequestError::Api(ApiError::InvalidStickersSet)) => return Ok(None),
            Err(e) => return Err(map_err(e)),
        };
        Ok(Some(Container {
            link: set.name,
            title: set.title,
            items: set
                .stickers
                .iter()
                .map(|s| PublishedItem {
                    reference: sticker_reference(self.kind, s),
                })
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sticker(extra: serde_json::Value) -> Sticker {
        let mut v = json!({
            "file_id": "file-1",
            "file_unique_id": "u-1",
            "width": 100,
            "height": 100,
            "is_animated": false,
            "is_video": true,
        });
        if let (Some(obj), Some(more)) = (v.as_object_mut(), extra.as_object()) {
            obj.extend(more.clone());
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn emoji_sets_reference_the_custom_emoji_id() {
        let s = sticker(json!({"type": "custom_emoji", "custom_emoji_id": "5368324170671202286"}));
        assert_eq!(
            sticker_reference(PackKind::CustomEmoji, &s),
            "5368324170671202286"
        );
        assert_eq!(sticker_reference(PackKind::Sticker, &s), "file-1");
    }

    #[test]
    fn regular_stickers_fall_back_to_the_file_id() {
        let s = sticker(json!({"type": "regular"}));
        assert_eq!(sticker_reference(PackKind::CustomEmoji, &s), "file-1");
    }

    #[test]
    fn item_formats_map_to_sticker_formats() {
        assert_eq!(sticker_format(ItemFormat::Video), StickerFormat::Video);
        assert_eq!(sticker_format(ItemFormat::Static), StickerFormat::Static);
        assert_eq!(sticker_type(PackKind::CustomEmoji), StickerType::CustomEmoji);
    }
}
