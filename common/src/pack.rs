use crate::card::CardFace;

/// The deck shipped with the server. Rooms may swap it out for any
/// owner-supplied deck; ids are renumbered 1..n on application either
/// way.
pub fn default_pack() -> Vec<CardFace> {
    const FACES: [&str; 25] = [
        "Radioactive",
        "Love",
        "Ghibli",
        "Death",
        "Surreal",
        "Robots",
        "No Style",
        "Wuhtercuhler",
        "Provenance",
        "Moonwalker",
        "Blacklight",
        "Rose Gold",
        "Steampunk",
        "Fantasy Art",
        "Vibrant",
        "HD",
        "Psychic",
        "Dark Fantasy",
        "Mystical",
        "Baroque",
        "Etching",
        "S.Dali",
        "Psychedelic",
        "Synthwave",
        "Ukiyoe",
    ];

    FACES
        .iter()
        .enumerate()
        .map(|(i, title)| CardFace {
            id: (i + 1) as u16,
            title: (*title).to_string(),
            url: format!("/packs/classic/{}.jpg", title.replace(' ', "")),
        })
        .collect()
}
