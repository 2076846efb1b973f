//! Built-in notification types.

use super::{MessageContent, NotificationResolver, ResolveContext};
use crate::entities::NotificationType;

/// Someone else's bid on a followed auction was settled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewBidResolver;

impl NotificationResolver for NewBidResolver {
    fn notification_type(&self) -> NotificationType {
        NotificationType::NewBid
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MessageContent> {
        let bid = ctx.bid?;
        if bid.buyer_id == ctx.user.id {
            return None;
        }

        Some(MessageContent {
            key: format!("new-bid:{}", bid.id),
            user_id: ctx.user.id,
            body: format!(
                "Hi {}! There is a new bid of {} sats on \"{}\".",
                ctx.user.display_name(),
                bid.amount,
                ctx.auction.title
            ),
        })
    }
}

/// A followed auction ends within the window.
#[derive(Debug, Clone, Copy)]
pub struct EndingSoonResolver {
    window: time::Duration,
}

impl EndingSoonResolver {
    pub fn new(window: time::Duration) -> Self {
        Self { window }
    }
}

impl NotificationResolver for EndingSoonResolver {
    fn notification_type(&self) -> NotificationType {
        NotificationType::AuctionEndingSoon
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MessageContent> {
        if ctx.bid.is_some() {
            return None;
        }
        let auction = ctx.auction;
        if auction.has_ended(ctx.now) || auction.end_date > ctx.now + self.window {
            return None;
        }

        let minutes_left = (auction.end_date - ctx.now).whole_minutes().max(1);
        let extended = if auction.was_extended() {
            " It was extended by late bids."
        } else {
            ""
        };

        Some(MessageContent {
            key: format!("ending-soon:{}", auction.id),
            user_id: ctx.user.id,
            body: format!(
                "Hi {}! \"{}\" ends in about {} minutes.{}",
                ctx.user.display_name(),
                auction.title,
                minutes_left,
                extended
            ),
        })
    }
}

/// A followed auction has ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuctionEndedResolver;

impl NotificationResolver for AuctionEndedResolver {
    fn notification_type(&self) -> NotificationType {
        NotificationType::AuctionEnded
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MessageContent> {
        if ctx.bid.is_some() || !ctx.auction.has_ended(ctx.now) {
            return None;
        }

        Some(MessageContent {
            key: format!("auction-ended:{}", ctx.auction.id),
            user_id: ctx.user.id,
            body: format!(
                "Hi {}! \"{}\" has ended.",
                ctx.user.display_name(),
                ctx.auction.title
            ),
        })
    }
}

/// The user holds the winning bid of an ended auction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuctionWonResolver;

impl NotificationResolver for AuctionWonResolver {
    fn notification_type(&self) -> NotificationType {
        NotificationType::AuctionWon
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MessageContent> {
        if ctx.bid.is_some() || !ctx.auction.has_ended(ctx.now) {
            return None;
        }
        let winning_bid = ctx.winning_bid?;
        if winning_bid.buyer_id != ctx.user.id {
            return None;
        }

        Some(MessageContent {
            key: format!("auction-won:{}", ctx.auction.id),
            user_id: ctx.user.id,
            body: format!(
                "Congratulations {}! You won \"{}\" with {} sats.",
                ctx.user.display_name(),
                ctx.auction.title,
                winning_bid.amount
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{auction, bid, user};
    use time::macros::datetime;

    #[test]
    fn test_new_bid_skips_the_bidder() {
        let a = auction(3, datetime!(2024-05-01 12:00));
        let b = bid(30, 3, 7, 21_000, "lnbc");
        let bidder = user(7);
        let watcher = user(8);
        let now = datetime!(2024-05-01 10:00);

        let ctx = |u| ResolveContext {
            user: u,
            auction: &a,
            bid: Some(&b),
            winning_bid: None,
            now,
        };

        assert!(NewBidResolver.resolve(&ctx(&bidder)).is_none());
        let content = NewBidResolver.resolve(&ctx(&watcher)).unwrap();
        assert_eq!(content.key, "new-bid:30");
        assert_eq!(content.user_id, 8);
        assert!(content.body.contains("21000 sats"));
    }

    #[test]
    fn test_ending_soon_only_inside_window() {
        let resolver = EndingSoonResolver::new(time::Duration::minutes(10));
        let a = auction(4, datetime!(2024-05-01 12:00));
        let u = user(8);
        let at = |now| ResolveContext {
            user: &u,
            auction: &a,
            bid: None,
            winning_bid: None,
            now,
        };

        assert!(resolver.resolve(&at(datetime!(2024-05-01 11:49))).is_none());
        let content = resolver.resolve(&at(datetime!(2024-05-01 11:55))).unwrap();
        assert_eq!(content.key, "ending-soon:4");
        assert!(content.body.contains("5 minutes"));
        assert!(resolver.resolve(&at(datetime!(2024-05-01 12:00))).is_none());
    }

    #[test]
    fn test_ending_soon_mentions_extension() {
        let resolver = EndingSoonResolver::new(time::Duration::minutes(10));
        let mut a = auction(4, datetime!(2024-05-01 12:00));
        a.end_date = datetime!(2024-05-01 12:03);
        let u = user(8);
        let ctx = ResolveContext {
            user: &u,
            auction: &a,
            bid: None,
            winning_bid: None,
            now: datetime!(2024-05-01 12:00),
        };

        let content = resolver.resolve(&ctx).unwrap();
        assert!(content.body.contains("extended"));
    }

    #[test]
    fn test_won_only_for_winning_bidder() {
        let a = auction(5, datetime!(2024-05-01 12:00));
        let winning = bid(50, 5, 7, 90_000, "lnbc");
        let winner = user(7);
        let loser = user(8);
        let now = datetime!(2024-05-01 12:01);
        let ctx = |u, winning_bid| ResolveContext {
            user: u,
            auction: &a,
            bid: None,
            winning_bid,
            now,
        };

        assert!(AuctionWonResolver.resolve(&ctx(&winner, None)).is_none());
        assert!(
            AuctionWonResolver
                .resolve(&ctx(&loser, Some(&winning)))
                .is_none()
        );
        let content = AuctionWonResolver
            .resolve(&ctx(&winner, Some(&winning)))
            .unwrap();
        assert_eq!(content.key, "auction-won:5");

        // Ended applies to everyone following.
        assert!(AuctionEndedResolver.resolve(&ctx(&loser, None)).is_some());
    }
}
