//! Possibly under-specified asks for computed quantities

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ComputationTargetRef, ResultDescriptor};

/// A constraint on one property of a requested value
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyConstraint {
    /// The property must hold exactly this value
    Fixed(String),
    /// The property must hold one of these values
    OneOf(BTreeSet<String>),
    /// Any value satisfies, including absence
    Wildcard,
}

impl PropertyConstraint {
    /// One-of constraint from an iterator of candidates
    pub fn one_of<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf(candidates.into_iter().map(Into::into).collect())
    }

    /// Whether a concrete property value satisfies this constraint
    ///
    /// `value` is `None` when the descriptor does not carry the property at
    /// all; only [`PropertyConstraint::Wildcard`] admits that.
    pub fn admits(&self, value: Option<&str>) -> bool {
        match self {
            Self::Fixed(required) => value == Some(required.as_str()),
            Self::OneOf(candidates) => {
                value.is_some_and(|v| candidates.contains(v))
            }
            Self::Wildcard => true,
        }
    }
}

/// A request for a computed quantity, resolved against a dependency graph
///
/// Unlike a [`ResultDescriptor`], a request may be under-specified: several
/// descriptors can satisfy one request until the graph compiler resolves it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultRequest {
    /// The named quantity being asked for
    pub value_name: String,
    /// What the quantity is to be computed for
    pub target: ComputationTargetRef,
    /// Per-property constraints; unconstrained properties are unrestricted
    pub constraints: BTreeMap<String, PropertyConstraint>,
}

impl ResultRequest {
    /// An unconstrained request for a value on a target
    pub fn new(value_name: impl Into<String>, target: ComputationTargetRef) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: BTreeMap::new(),
        }
    }

    /// Add a constraint on one property
    #[must_use]
    pub fn constrained(mut self, key: impl Into<String>, constraint: PropertyConstraint) -> Self {
        self.constraints.insert(key.into(), constraint);
        self
    }

    /// Whether the descriptor is one of the quantities this request asks for
    ///
    /// Value name and target must match exactly; every constrained property
    /// must be admitted by its constraint. Properties the request does not
    /// mention are unrestricted.
    pub fn is_satisfied_by(&self, descriptor: &ResultDescriptor) -> bool {
        if self.value_name != descriptor.value_name || self.target != descriptor.target {
            return false;
        }
        self.constraints
            .iter()
            .all(|(key, constraint)| constraint.admits(descriptor.properties.get(key)))
    }
}

impl fmt::Display for ResultRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ?{{", self.value_name, self.target)?;
        for (i, (key, constraint)) in self.constraints.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match constraint {
                PropertyConstraint::Fixed(v) => write!(f, "{key}={v}")?,
                PropertyConstraint::OneOf(vs) => {
                    write!(f, "{key}in[")?;
                    for (j, v) in vs.iter().enumerate() {
                        if j > 0 {
                            write!(f, "|")?;
                        }
                        write!(f, "{v}")?;
                    }
                    write!(f, "]")?;
                }
                PropertyConstraint::Wildcard => write!(f, "{key}=*")?,
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TargetKind;
    use crate::id::UniqueId;
    use crate::properties::ValueProperties;

    fn target() -> ComputationTargetRef {
        ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1"))
    }

    fn pv(currency: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            "Present Value",
            target(),
            ValueProperties::builder().with("Currency", currency).build(),
        )
    }

    #[test]
    fn unconstrained_request_matches_any_properties() {
        let request = ResultRequest::new("Present Value", target());
        assert!(request.is_satisfied_by(&pv("USD")));
        assert!(request.is_satisfied_by(&pv("EUR")));
    }

    #[test]
    fn fixed_constraint_is_exact() {
        let request = ResultRequest::new("Present Value", target())
            .constrained("Currency", PropertyConstraint::Fixed("USD".into()));
        assert!(request.is_satisfied_by(&pv("USD")));
        assert!(!request.is_satisfied_by(&pv("EUR")));
    }

    #[test]
    fn one_of_constraint_admits_candidates_only() {
        let request = ResultRequest::new("Present Value", target())
            .constrained("Currency", PropertyConstraint::one_of(["USD", "GBP"]));
        assert!(request.is_satisfied_by(&pv("GBP")));
        assert!(!request.is_satisfied_by(&pv("EUR")));
    }

    #[test]
    fn wildcard_admits_absent_property() {
        let request = ResultRequest::new("Present Value", target())
            .constrained("Currency", PropertyConstraint::Wildcard);
        let bare = ResultDescriptor::new("Present Value", target(), ValueProperties::none());
        assert!(request.is_satisfied_by(&bare));
    }

    #[test]
    fn fixed_constraint_rejects_absent_property() {
        let request = ResultRequest::new("Present Value", target())
            .constrained("Currency", PropertyConstraint::Fixed("USD".into()));
        let bare = ResultDescriptor::new("Present Value", target(), ValueProperties::none());
        assert!(!request.is_satisfied_by(&bare));
    }

    #[test]
    fn name_and_target_must_match() {
        let request = ResultRequest::new("Delta", target());
        assert!(!request.is_satisfied_by(&pv("USD")));

        let other_target =
            ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "2"));
        let request = ResultRequest::new("Present Value", other_target);
        assert!(!request.is_satisfied_by(&pv("USD")));
    }
}
