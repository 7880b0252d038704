//! Disposable-domain detection.
//!
//! A compact built-in list of throwaway-mail providers, extensible from
//! configuration. Lookups also match parent domains, so a hit on
//! `tempmail.com` covers `mail.tempmail.com`.

use ahash::AHashSet;

use verity_common::Domain;

/// Providers that hand out short-lived mailboxes. Deliverable, but nothing
/// you want on a subscriber list.
const BUILTIN: &[&str] = &[
    "10minutemail.com",
    "20minutemail.com",
    "33mail.com",
    "dispostable.com",
    "discard.email",
    "emailondeck.com",
    "fakeinbox.com",
    "getairmail.com",
    "getnada.com",
    "guerrillamail.com",
    "guerrillamail.org",
    "inboxkitten.com",
    "maildrop.cc",
    "mailinator.com",
    "mailnesia.com",
    "mailsac.com",
    "mintemail.com",
    "mohmal.com",
    "mytemp.email",
    "sharklasers.com",
    "spam4.me",
    "spamgourmet.com",
    "temp-mail.org",
    "tempail.com",
    "tempmail.com",
    "tempmail.dev",
    "tempmailo.com",
    "tempr.email",
    "throwawaymail.com",
    "trash-mail.com",
    "trashmail.com",
    "yopmail.com",
];

/// The set of known disposable domains.
pub struct DisposableSet {
    domains: AHashSet<String>,
}

impl DisposableSet {
    /// The built-in list plus any configured extras.
    #[must_use]
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains: AHashSet<String> =
            BUILTIN.iter().map(|d| (*d).to_string()).collect();
        domains.extend(extra.into_iter().map(|d| d.as_ref().to_ascii_lowercase()));
        Self { domains }
    }

    /// Whether the domain, or any parent of it, is disposable.
    #[must_use]
    pub fn contains(&self, domain: &Domain) -> bool {
        let name = domain.as_str();
        let mut rest = name;
        loop {
            if self.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, parent)) if parent.contains('.') => rest = parent,
                _ => return false,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl Default for DisposableSet {
    fn default() -> Self {
        Self::with_extra(std::iter::empty::<&str>())
    }
}
