use std::collections::HashSet;
use std::sync::Mutex;

/// Process-scoped record of which pods were held back and why. Lost on
/// restart; savings for pods deferred before and completing after a restart
/// are skipped.
#[derive(Default)]
pub struct DeferralSets {
    carbon: Mutex<HashSet<String>>,
    price: Mutex<HashSet<String>>,
}

impl DeferralSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer_carbon(&self, uid: &str) {
        self.carbon
            .lock()
            .expect("deferral set poisoned")
            .insert(uid.to_string());
    }

    pub fn defer_price(&self, uid: &str) {
        self.price
            .lock()
            .expect("deferral set poisoned")
            .insert(uid.to_string());
    }

    pub fn is_carbon_deferred(&self, uid: &str) -> bool {
        self.carbon.lock().expect("deferral set poisoned").contains(uid)
    }

    pub fn is_price_deferred(&self, uid: &str) -> bool {
        self.price.lock().expect("deferral set poisoned").contains(uid)
    }

    /// Removes the pod from both sets, reporting prior membership as
    /// `(carbon, price)`.
    pub fn take(&self, uid: &str) -> (bool, bool) {
        let carbon = self.carbon.lock().expect("deferral set poisoned").remove(uid);
        let price = self.price.lock().expect("deferral set poisoned").remove(uid);
        (carbon, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_reports_and_clears_membership() {
        let sets = DeferralSets::new();
        sets.defer_carbon("uid-1");
        sets.defer_price("uid-1");
        sets.defer_carbon("uid-2");

        assert_eq!(sets.take("uid-1"), (true, true));
        assert_eq!(sets.take("uid-1"), (false, false));
        assert_eq!(sets.take("uid-2"), (true, false));
        assert!(!sets.is_carbon_deferred("uid-2"));
    }
}
