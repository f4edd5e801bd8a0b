//! Entities shared by the unit tests of this crate.

use trackmodel_core::{
    Entity, JunctionInfo, Link, Related, RelatedMany, RelationshipInfo, Result, Row, Value,
};

pub const BRICK_TAGS: JunctionInfo = JunctionInfo::new("brick_tags", "brick_id", "tag_id");

#[derive(Debug, Clone, PartialEq)]
pub struct Vendor {
    pub id: Option<i64>,
    pub vendor_name: String,
}

impl Vendor {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            vendor_name: name.to_string(),
        }
    }
}

impl Entity for Vendor {
    const ENTITY_NAME: &'static str = "vendors";
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::one_to_many("bricks", "bricks", "vendor_id")];

    fn key(&self) -> Option<i64> {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = Some(key);
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("vendor_name", Value::from(self.vendor_name.as_str()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            vendor_name: row.get_named("vendor_name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Brick {
    pub id: Option<i64>,
    pub title: String,
    pub vendor: Related<Vendor>,
    pub tags: RelatedMany<Tag>,
}

impl Brick {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            vendor: Related::empty(),
            tags: RelatedMany::new(),
        }
    }
}

impl Entity for Brick {
    const ENTITY_NAME: &'static str = "bricks";
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::many_to_one("vendor", "vendors", "vendor_id"),
        RelationshipInfo::many_to_many("tags", "tags", BRICK_TAGS).back_populates("bricks"),
    ];

    fn key(&self) -> Option<i64> {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = Some(key);
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("title", Value::from(self.title.as_str())),
            ("vendor_id", self.vendor.fk_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            vendor: Related::from_column(row, "vendor_id")?,
            tags: RelatedMany::new(),
        })
    }

    fn references(&self) -> Vec<(&'static str, Option<Link>)> {
        vec![("vendor", self.vendor.link())]
    }

    fn set_reference(&mut self, relationship: &str, link: Option<Link>) {
        if relationship == "vendor" {
            self.vendor.set_link(link);
        }
    }

    fn collections(&self) -> Vec<(&'static str, Vec<Link>)> {
        vec![("tags", self.tags.to_vec())]
    }

    fn set_collection(&mut self, relationship: &str, links: Vec<Link>) {
        if relationship == "tags" {
            self.tags = RelatedMany::from_links(links);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: Option<i64>,
    pub name: String,
    pub bricks: RelatedMany<Brick>,
}

impl Tag {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            bricks: RelatedMany::new(),
        }
    }
}

impl Entity for Tag {
    const ENTITY_NAME: &'static str = "tags";
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::many_to_many("bricks", "bricks", BRICK_TAGS)
            .inverse()
            .back_populates("tags")];

    fn key(&self) -> Option<i64> {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = Some(key);
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("name", Value::from(self.name.as_str()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            bricks: RelatedMany::new(),
        })
    }

    fn collections(&self) -> Vec<(&'static str, Vec<Link>)> {
        vec![("bricks", self.bricks.to_vec())]
    }

    fn set_collection(&mut self, relationship: &str, links: Vec<Link>) {
        if relationship == "bricks" {
            self.bricks = RelatedMany::from_links(links);
        }
    }
}
