use std::fmt;

/// Model families a worker can load. Each one is configured by `setup_<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Image captioning.
    Caption,
    /// Image tagging.
    Tag,
    /// Segmentation masks and detection boxes.
    Mask,
    /// Text and image embeddings.
    Embed,
    /// Image upscaling.
    Upscale,
}

impl Capability {
    /// Every capability, in wire order.
    pub const ALL: [Capability; 5] = [
        Capability::Caption,
        Capability::Tag,
        Capability::Mask,
        Capability::Embed,
        Capability::Upscale,
    ];

    /// Name used in `setup_<name>`.
    pub fn name(self) -> &'static str {
        match self {
            Capability::Caption => "caption",
            Capability::Tag => "tag",
            Capability::Mask => "mask",
            Capability::Embed => "embed",
            Capability::Upscale => "upscale",
        }
    }

    /// Inverse of [`Capability::name`].
    pub fn parse(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of commands understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Round trip, the reply echoes the request.
    Echo,
    /// Ends the peer. Never answered.
    Quit,
    /// One chunk of an image upload to the host side cache.
    CacheImg,
    /// Drops an image from the host side cache.
    UncacheImg,
    /// Loads a model for a capability.
    Setup(Capability),
    /// Caption an image.
    Caption,
    /// Tag an image.
    Tag,
    /// Segmentation mask for an image.
    Mask,
    /// Detection boxes for an image.
    MaskBoxes,
    /// Embedding of a text.
    EmbedText,
    /// Embedding of an image.
    EmbedImg,
    /// Upscale an image file.
    ImgfileUpscale,
    /// Token boundaries of a text for the loaded caption model.
    TokenCountBorders,
}

const PLAIN: [Command; 12] = [
    Command::Echo,
    Command::Quit,
    Command::CacheImg,
    Command::UncacheImg,
    Command::Caption,
    Command::Tag,
    Command::Mask,
    Command::MaskBoxes,
    Command::EmbedText,
    Command::EmbedImg,
    Command::ImgfileUpscale,
    Command::TokenCountBorders,
];

impl Command {
    /// The `"cmd"` string of this command.
    pub fn name(self) -> &'static str {
        match self {
            Command::Echo => "echo",
            Command::Quit => "quit",
            Command::CacheImg => "cache_img",
            Command::UncacheImg => "uncache_img",
            Command::Setup(Capability::Caption) => "setup_caption",
            Command::Setup(Capability::Tag) => "setup_tag",
            Command::Setup(Capability::Mask) => "setup_mask",
            Command::Setup(Capability::Embed) => "setup_embed",
            Command::Setup(Capability::Upscale) => "setup_upscale",
            Command::Caption => "caption",
            Command::Tag => "tag",
            Command::Mask => "mask",
            Command::MaskBoxes => "mask_boxes",
            Command::EmbedText => "embed_text",
            Command::EmbedImg => "embed_img",
            Command::ImgfileUpscale => "imgfile_upscale",
            Command::TokenCountBorders => "token_count_borders",
        }
    }

    /// Inverse of [`Command::name`]; `None` for names outside the protocol.
    pub fn parse(name: &str) -> Option<Command> {
        if let Some(capability) = name.strip_prefix("setup_") {
            return Capability::parse(capability).map(Command::Setup);
        }
        PLAIN.iter().copied().find(|c| c.name() == name)
    }

    /// Reply field carrying the result of a call.
    pub fn payload_key(self) -> Option<&'static str> {
        match self {
            Command::Echo => Some("data"),
            Command::Caption => Some("captions"),
            Command::Tag => Some("tags"),
            Command::Mask => Some("mask"),
            Command::MaskBoxes => Some("boxes"),
            Command::EmbedText | Command::EmbedImg => Some("embedding"),
            Command::ImgfileUpscale => Some("img"),
            Command::TokenCountBorders => Some("borders"),
            Command::Quit | Command::CacheImg | Command::UncacheImg | Command::Setup(_) => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
