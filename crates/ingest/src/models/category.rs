//! The fixed set of report categories ingested from the platform

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One report type exported by the operations platform
///
/// The set is closed: every run tracks exactly these categories, and
/// per-category maps are sized by [`Category::COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    NewCustomers,
    Orders,
    FirstVisits,
    ActiveSubscriptions,
    PausedSubscriptions,
    TrialingSubscriptions,
    NewSubscriptions,
    CanceledSubscriptions,
    FullRegistrations,
    RevenueCategories,
}

impl Category {
    pub const COUNT: usize = 10;

    /// Every category, in tracking order
    pub const ALL: [Category; Self::COUNT] = [
        Category::NewCustomers,
        Category::Orders,
        Category::FirstVisits,
        Category::ActiveSubscriptions,
        Category::PausedSubscriptions,
        Category::TrialingSubscriptions,
        Category::NewSubscriptions,
        Category::CanceledSubscriptions,
        Category::FullRegistrations,
        Category::RevenueCategories,
    ];

    /// Position in [`Category::ALL`], used to index fixed-size per-category slots
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable identifier used in storage keys and the trigger protocol
    pub fn as_str(self) -> &'static str {
        match self {
            Category::NewCustomers => "new_customers",
            Category::Orders => "orders",
            Category::FirstVisits => "first_visits",
            Category::ActiveSubscriptions => "active_subscriptions",
            Category::PausedSubscriptions => "paused_subscriptions",
            Category::TrialingSubscriptions => "trialing_subscriptions",
            Category::NewSubscriptions => "new_subscriptions",
            Category::CanceledSubscriptions => "canceled_subscriptions",
            Category::FullRegistrations => "full_registrations",
            Category::RevenueCategories => "revenue_categories",
        }
    }

    /// Human-readable name for listings
    pub fn display_name(self) -> &'static str {
        match self {
            Category::NewCustomers => "New Customers",
            Category::Orders => "Orders",
            Category::FirstVisits => "First Visits",
            Category::ActiveSubscriptions => "Active Subscriptions",
            Category::PausedSubscriptions => "Paused Subscriptions",
            Category::TrialingSubscriptions => "Trialing Subscriptions",
            Category::NewSubscriptions => "New Subscriptions",
            Category::CanceledSubscriptions => "Canceled Subscriptions",
            Category::FullRegistrations => "Full Registrations",
            Category::RevenueCategories => "Revenue Categories",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category identifier
#[derive(Debug, thiserror::Error)]
#[error("Unknown report category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}
